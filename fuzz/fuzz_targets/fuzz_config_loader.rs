#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Arbitrary TOML must either fail to parse, fail validation, or load;
    // never panic.
    if let Ok(cfg) = motion_config::load_toml(data) {
        if cfg.validate().is_ok() {
            // a valid channel map never repeats a channel
            let mut seen = std::collections::HashSet::new();
            for m in &cfg.motors {
                assert!(seen.insert(m.forward) && seen.insert(m.reverse));
            }
        }
    }
});
