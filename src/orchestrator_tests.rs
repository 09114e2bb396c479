use super::*;
use test_case::test_case;

#[test_case(Filesystem::Fat32, "Ubuntu 24.04.1 LTS", "UBUNTU24041"; "fat32 strips and uppercases")]
#[test_case(Filesystem::Fat32, "my-usb", "MY-USB"; "fat32 keeps hyphen")]
#[test_case(Filesystem::Fat32, "Tráveler", "TRVELER"; "fat32 drops non ascii")]
#[test_case(Filesystem::Fat32, "", "UNTITLED"; "empty falls back")]
#[test_case(Filesystem::Fat32, "!!!", "UNTITLED"; "all invalid falls back")]
#[test_case(Filesystem::ExFat, "persistence!", "persistence"; "exfat keeps case")]
#[test_case(Filesystem::Hfs, "Data Backup Drive 2024", "DataBackupDrive2024"; "hfs keeps case and length")]
fn test_sanitize_label(filesystem: Filesystem, requested: &str, expected: &str) {
    assert_eq!(sanitize_label(filesystem, requested), expected);
}

#[test]
fn test_sanitized_labels_obey_charset_and_length() {
    let hostile = [
        "a very long label that goes on and on and on",
        "quotes'\"and spaces",
        "slash/back\\slash",
        "ünïcödé-label",
        "UPPER lower 123_ok-",
    ];
    for requested in hostile {
        for filesystem in [Filesystem::Fat32, Filesystem::ExFat, Filesystem::Hfs] {
            let label = sanitize_label(filesystem, requested);
            assert!(label.len() <= filesystem.max_label_len());
            assert!(
                label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'),
                "bad char in {:?}",
                label
            );
            assert!(!label.is_empty());
        }
    }
}

mod preflight {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_oversized_file_fails_for_fat_before_anything_destructive() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sources")).unwrap();
        // Sparse 5 GiB file: metadata reports the full length without
        // consuming disk.
        let big = std::fs::File::create(dir.path().join("sources/install.wim")).unwrap();
        big.set_len(5 * 1024 * 1024 * 1024).unwrap();

        let err = preflight_fat_scan(dir.path(), Filesystem::Fat32).unwrap_err();
        match err {
            FlashError::OversizedFileForFat(file) => {
                assert_eq!(file, std::path::PathBuf::from("sources/install.wim"));
            }
            other => panic!("expected OversizedFileForFat, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_file_is_fine_for_non_fat() {
        let dir = TempDir::new().unwrap();
        let big = std::fs::File::create(dir.path().join("install.esd")).unwrap();
        big.set_len(5 * 1024 * 1024 * 1024).unwrap();

        assert!(preflight_fat_scan(dir.path(), Filesystem::ExFat).is_ok());
        assert!(preflight_fat_scan(dir.path(), Filesystem::Hfs).is_ok());
    }

    #[test]
    fn test_small_tree_passes_fat_preflight() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bootmgr"), b"x").unwrap();
        assert!(preflight_fat_scan(dir.path(), Filesystem::Fat32).is_ok());
    }
}

mod pipeline {
    use super::*;
    use crate::ImagingOptions;

    #[tokio::test]
    async fn test_dd_mode_with_missing_image_fails_cleanly() {
        let options = ImagingOptions {
            device: "disk99".to_string(),
            image: std::path::PathBuf::from("/nonexistent/image.img"),
            mode: ImagingMode::Dd,
            ..Default::default()
        };

        let handle = Imager::start(options);
        let result = handle.wait().await;
        assert!(matches!(result, Err(FlashError::IsoMountFailed(_))));
    }

    #[tokio::test]
    async fn test_terminal_status_is_failed_on_error() {
        let options = ImagingOptions {
            device: "disk99".to_string(),
            image: std::path::PathBuf::from("/nonexistent/image.img"),
            mode: ImagingMode::Dd,
            ..Default::default()
        };

        let handle = Imager::start(options);
        let mut status = handle.status.clone();
        let _ = handle.wait().await;
        // The watch channel retains the terminal phase.
        let phase = status.borrow_and_update().clone();
        assert!(matches!(phase, Phase::Failed { .. }));
    }

    #[tokio::test]
    async fn test_cancel_before_work_yields_cancelled() {
        let dir = tempfile::TempDir::new().unwrap();
        let image = dir.path().join("tiny.img");
        std::fs::write(&image, vec![0u8; 1024]).unwrap();

        let options = ImagingOptions {
            device: "disk99".to_string(),
            image,
            mode: ImagingMode::Dd,
            ..Default::default()
        };

        let handle = Imager::start(options);
        handle.cancel();
        let result = handle.wait().await;
        assert!(matches!(result, Err(FlashError::Cancelled)));
    }
}
