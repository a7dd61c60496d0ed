#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use docsd_core::state_store::DocsdStateStore;
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    // `load_or_default` must never panic on arbitrary bytes, only fall back
    // to an empty document (`persist::load_json_lenient` returns `None`).
    let path = td.path().join("daemon-state.json");
    if fs::write(&path, data).is_ok() {
        let _ = DocsdStateStore::load_or_default(path);
    }
});
