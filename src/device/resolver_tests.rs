use super::*;

const DISKUTIL_INFO_PARTITION: &str = "\
   Device Identifier:         disk4s1
   Device Node:               /dev/disk4s1
   Whole:                     No
   Part of Whole:             disk4

   Volume Name:               UBUNTU 24_0
   Mounted:                   Yes
   Mount Point:               /Volumes/UBUNTU 24_0

   File System Personality:   MS-DOS FAT32
   Volume Total Size:         15.5 GB (15476981760 Bytes) (exactly 30228480 512-Byte-Units)
   Volume Free Space:         8.0 GB (8053063680 Bytes) (exactly 15728640 512-Byte-Units)

   Removable Media:           Removable
";

const DISKUTIL_INFO_NO_FREE: &str = "\
   Device Identifier:         disk4s2
   Mounted:                   No
   Disk Size:                 15.5 GB (15476981760 Bytes) (exactly 30228480 512-Byte-Units)
";

#[test]
fn test_extract_field_present() {
    assert_eq!(
        extract_field(DISKUTIL_INFO_PARTITION, "Device Identifier"),
        Some("disk4s1".to_string())
    );
    assert_eq!(
        extract_field(DISKUTIL_INFO_PARTITION, "Mount Point"),
        Some("/Volumes/UBUNTU 24_0".to_string())
    );
}

#[test]
fn test_extract_field_missing() {
    assert_eq!(extract_field(DISKUTIL_INFO_PARTITION, "Nonexistent"), None);
}

#[test]
fn test_extract_field_keeps_spaces_in_value() {
    // Volume names may contain colons' worth of junk; only the first colon
    // splits key from value.
    let output = "   Volume Name:               Data: backup";
    assert_eq!(
        extract_field(output, "Volume Name"),
        Some("Data: backup".to_string())
    );
}

#[test]
fn test_extract_bytes_field() {
    assert_eq!(
        extract_bytes_field(DISKUTIL_INFO_PARTITION, "Volume Free Space"),
        Some(8053063680)
    );
    assert_eq!(
        extract_bytes_field(DISKUTIL_INFO_PARTITION, "Volume Total Size"),
        Some(15476981760)
    );
    assert_eq!(
        extract_bytes_field(DISKUTIL_INFO_NO_FREE, "Volume Free Space"),
        None
    );
}

#[test]
fn test_strip_partition_suffix() {
    assert_eq!(
        strip_partition_suffix("disk4s1"),
        Some("disk4".to_string())
    );
    assert_eq!(
        strip_partition_suffix("disk12s10"),
        Some("disk12".to_string())
    );
    assert_eq!(strip_partition_suffix("disk4"), Some("disk4".to_string()));
}

#[test]
fn test_strip_partition_suffix_rejects_garbage() {
    assert_eq!(strip_partition_suffix("sda1"), None);
    assert_eq!(strip_partition_suffix("rdisk4s1"), None);
    assert_eq!(strip_partition_suffix(""), None);
    assert_eq!(strip_partition_suffix("disk"), None);
}

#[test]
fn test_candidate_suffixes_order() {
    // GPT layouts hide an EFI system partition at index 1, so the data
    // partition is probed at index 2 first.
    assert_eq!(candidate_suffixes(PartitionScheme::GPT), &[2, 1, 3]);
    assert_eq!(candidate_suffixes(PartitionScheme::MBR), &[1, 2]);
}
