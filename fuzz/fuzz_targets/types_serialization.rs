#![no_main]

use libfuzzer_sys::fuzz_target;
use docsd_types::{BuildReport, JobSnapshot, RepositoryDescriptor};

fuzz_target!(|data: &[u8]| {
    // Try to parse as JSON and verify serialization roundtrips.
    let Ok(json_str) = std::str::from_utf8(data) else {
        return;
    };

    // BuildReport roundtrip.
    if let Ok(report) = serde_json::from_str::<BuildReport>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&report) {
            if let Ok(parsed) = serde_json::from_str::<BuildReport>(&roundtripped) {
                assert_eq!(report.outcome, parsed.outcome);
                assert_eq!(report.rendered_pages, parsed.rendered_pages);
                assert_eq!(report.doc_files_hash, parsed.doc_files_hash);
            }
        }
    }

    // JobSnapshot roundtrip.
    if let Ok(snapshot) = serde_json::from_str::<JobSnapshot>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&snapshot) {
            if let Ok(parsed) = serde_json::from_str::<JobSnapshot>(&roundtripped) {
                assert_eq!(snapshot.id, parsed.id);
                assert_eq!(snapshot.status, parsed.status);
            }
        }
    }

    // RepositoryDescriptor roundtrip.
    if let Ok(repo) = serde_json::from_str::<RepositoryDescriptor>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&repo) {
            if let Ok(parsed) = serde_json::from_str::<RepositoryDescriptor>(&roundtripped) {
                assert_eq!(repo.clone_url, parsed.clone_url);
                assert_eq!(repo.branch, parsed.branch);
            }
        }
    }
});