#![no_main]

use libfuzzer_sys::fuzz_target;
use vellum_core::format::scan_index_log;
use vellum_core::PositionIndex;

fuzz_target!(|data: &[u8]| {
    let scan = scan_index_log(data);
    assert!(scan.valid_len <= data.len());

    let (index, stats) = PositionIndex::from_scan(&scan, data.len());
    assert_eq!(stats.valid_len as usize + stats.ignored_tail as usize, data.len());
    assert!(index.len() <= stats.records);

    // Re-encoding the accepted prefix must reproduce it byte for byte
    let mut encoded = Vec::with_capacity(scan.valid_len);
    for record in &scan.records {
        record.encode_into(&mut encoded);
    }
    assert_eq!(&encoded[..], &data[..scan.valid_len]);
});
