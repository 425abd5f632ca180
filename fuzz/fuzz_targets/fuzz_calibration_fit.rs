#![no_main]
use biosense_config::{Calibration, CalibrationRow};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|pairs: Vec<(f64, f64)>| {
    let rows: Vec<CalibrationRow> = pairs
        .into_iter()
        .map(|(raw_v, reference_v)| CalibrationRow { raw_v, reference_v })
        .collect();
    // Degenerate inputs are rejected; accepted fits are finite.
    if let Ok(c) = Calibration::from_rows(rows) {
        assert!(c.offset_v.is_finite() && c.gain.is_finite());
    }
});
