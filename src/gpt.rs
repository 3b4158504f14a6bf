//! GPT partition table model.
//!
//! Tables are kept as an ordered map from partition number to [`Partition`]
//! and exchanged with `sfdisk` in its script/dump text format.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use uuid::{uuid, Uuid};

use crate::config::{BuildConfig, OutputFormat};
use crate::error::MkosiError;
use crate::process::Cmd;

pub const GPT_ROOT_X86_64: Uuid = uuid!("4f68bce3-e8cd-4db1-96e7-fbcaf984b709");
pub const GPT_ROOT_ARM_64: Uuid = uuid!("b921b045-1df0-41c3-af44-4c6f280d3fae");
pub const GPT_ESP: Uuid = uuid!("c12a7328-f81f-11d2-ba4b-00a0c93ec93b");
pub const GPT_SWAP: Uuid = uuid!("0657fd6d-a4ab-43c4-84e5-0933c84b4f4f");
pub const GPT_HOME: Uuid = uuid!("933ac7e1-2eb4-4f13-b844-0e14e2aef915");
pub const GPT_SRV: Uuid = uuid!("3b8f8425-20e0-4f3b-907f-1a25a76f98e8");
pub const GPT_ROOT_X86_64_VERITY: Uuid = uuid!("2c7357ed-ebd2-46d9-aec1-23d437ec2bf5");
pub const GPT_ROOT_ARM_64_VERITY: Uuid = uuid!("df3300ce-d69f-4c92-978c-9bfb0f38d820");

/// 1 MiB reserved before the first partition for the GPT label.
pub const GPT_HEADER_SIZE: u64 = 1024 * 1024;
/// 1 MiB reserved after the last partition for the backup label.
pub const GPT_FOOTER_SIZE: u64 = 1024 * 1024;

/// GPT attribute bit 60: read-only.
pub const ATTR_READ_ONLY: &str = "GUID:60";

/// Type GUIDs for the native root partition and its verity partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootTypePair {
    pub root: Uuid,
    pub verity: Uuid,
}

/// Root/verity type GUIDs for an architecture as reported by
/// `std::env::consts::ARCH`.
pub fn gpt_root_native(arch: &str) -> Result<RootTypePair> {
    match arch {
        "x86_64" => Ok(RootTypePair {
            root: GPT_ROOT_X86_64,
            verity: GPT_ROOT_X86_64_VERITY,
        }),
        "aarch64" => Ok(RootTypePair {
            root: GPT_ROOT_ARM_64,
            verity: GPT_ROOT_ARM_64_VERITY,
        }),
        other => bail!("Unknown architecture {}.", other),
    }
}

pub fn roundup512(x: u64) -> u64 {
    (x + 511) & !511
}

/// One partition entry. Sizes and starts are in 512-byte sectors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub start: Option<u64>,
    pub size: Option<u64>,
    pub type_uuid: Option<Uuid>,
    pub uuid: Option<Uuid>,
    pub name: Option<String>,
    pub attrs: Option<String>,
    pub bootable: bool,
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields = Vec::new();
        if let Some(start) = self.start {
            fields.push(format!("start={}", start));
        }
        if let Some(size) = self.size {
            fields.push(format!("size={}", size));
        }
        if let Some(t) = self.type_uuid {
            fields.push(format!("type={}", t));
        }
        if let Some(u) = self.uuid {
            fields.push(format!("uuid={}", u));
        }
        if let Some(ref name) = self.name {
            fields.push(format!("name={}", quote(name)));
        }
        if let Some(ref attrs) = self.attrs {
            fields.push(format!("attrs={}", attrs));
        }
        if self.bootable {
            fields.push("bootable".to_string());
        }
        f.write_str(&fields.join(", "))
    }
}

/// Partition table keyed by partition number, in on-disk order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionTable {
    entries: BTreeMap<u32, Partition>,
}

impl PartitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number the next appended partition would get.
    pub fn next_number(&self) -> u32 {
        self.entries.keys().next_back().map_or(1, |n| n + 1)
    }

    /// Append a partition and return its number.
    pub fn push(&mut self, partition: Partition) -> u32 {
        let n = self.next_number();
        self.entries.insert(n, partition);
        n
    }

    pub fn get(&self, partno: u32) -> Option<&Partition> {
        self.entries.get(&partno)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Partition)> {
        self.entries.iter().map(|(n, p)| (*n, p))
    }

    /// Byte offset just past the last allocated sector.
    pub fn end_offset(&self) -> u64 {
        self.entries
            .values()
            .filter_map(|p| Some(p.start? + p.size?))
            .max()
            .unwrap_or(0)
            * 512
    }

    /// `sfdisk` script for this table.
    pub fn to_script(&self) -> String {
        let mut script = String::from("label: gpt\n");
        for partition in self.entries.values() {
            script.push_str(&partition.to_string());
            script.push('\n');
        }
        script
    }

    /// Parse `sfdisk --dump` output. The body starts after the first empty
    /// line; each line is `<device>: field, field, ...`.
    ///
    /// Fields are split on every comma, so a quoted name containing a comma
    /// is not parsed correctly.
    pub fn parse_dump(dump: &str) -> Result<Self> {
        let mut table = Self::new();
        let mut in_body = false;

        for line in dump.lines() {
            let stripped = line.trim();
            if stripped.is_empty() {
                in_body = true;
                continue;
            }
            if !in_body {
                continue;
            }

            let (device, rest) = stripped
                .split_once(':')
                .with_context(|| format!("Malformed partition line: {}", stripped))?;
            let partno = trailing_number(device.trim())
                .with_context(|| format!("No partition number in: {}", device))?;

            let mut partition = Partition::default();
            for field in rest.split(',') {
                let f = field.trim();
                if let Some(v) = f.strip_prefix("start=") {
                    partition.start = Some(v.trim().parse().context("Bad start=")?);
                } else if let Some(v) = f.strip_prefix("size=") {
                    partition.size = Some(v.trim().parse().context("Bad size=")?);
                } else if let Some(v) = f.strip_prefix("type=") {
                    partition.type_uuid = Some(Uuid::parse_str(v.trim()).context("Bad type=")?);
                } else if let Some(v) = f.strip_prefix("uuid=") {
                    partition.uuid = Some(Uuid::parse_str(v.trim()).context("Bad uuid=")?);
                } else if let Some(v) = f.strip_prefix("name=") {
                    partition.name = Some(unquote(v));
                } else if let Some(v) = f.strip_prefix("attrs=") {
                    partition.attrs = Some(v.trim_matches('"').to_string());
                } else if f == "bootable" {
                    partition.bootable = true;
                }
            }
            table.entries.insert(partno, partition);
        }

        Ok(table)
    }
}

fn trailing_number(device: &str) -> Option<u32> {
    let digits = device.len() - device.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    device[device.len() - digits..].parse().ok()
}

/// Quote a partition name the way util-linux does: hex-escape `"`, `\`,
/// backtick, `$` and anything outside printable ASCII.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for &b in s.as_bytes() {
        if matches!(b, 0x22 | 0x5c | 0x60 | 0x24) || !(0x20..=0x7e).contains(&b) {
            out.push_str(&format!("\\x{:02x}", b));
        } else {
            out.push(b as char);
        }
    }
    out.push('"');
    out
}

/// Inverse of [`quote`]. Unquoted input is returned unchanged.
pub fn unquote(s: &str) -> String {
    let Some(inner) = s
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
    else {
        return s.to_string();
    };

    let bytes = inner.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1] == b'x'
            && bytes[i + 2].is_ascii_hexdigit()
            && bytes[i + 3].is_ascii_hexdigit()
        {
            // Both digits checked above.
            let hex = std::str::from_utf8(&bytes[i + 2..i + 4]).unwrap_or("00");
            out.push(u8::from_str_radix(hex, 16).unwrap_or(0));
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Apply a table to a device or image file.
pub fn write(device: &Path, table: &PartitionTable) -> Result<()> {
    Cmd::new("sfdisk")
        .arg("--color=never")
        .arg_path(device)
        .stdin_bytes(table.to_script())
        .error_msg("Writing partition table failed")
        .run()?;
    Cmd::new("sync").run()?;
    Ok(())
}

/// Read a device's table. Also returns the byte offset just past the last
/// allocated sector.
pub fn read(device: &Path) -> Result<(PartitionTable, u64)> {
    let result = Cmd::new("sfdisk")
        .arg("--dump")
        .arg_path(device)
        .error_msg("Reading partition table failed")
        .run()?;
    let table = PartitionTable::parse_dump(&result.stdout)?;
    let end = table.end_offset();
    Ok((table, end))
}

/// Partition numbers assigned by [`determine_layout`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionNumbers {
    pub esp: Option<u32>,
    pub swap: Option<u32>,
    pub home: Option<u32>,
    pub srv: Option<u32>,
    /// Always assigned. For raw_squashfs it names the slot the squashfs
    /// blob is inserted into later.
    pub root: Option<u32>,
    pub verity: Option<u32>,
}

/// Initial table for an image plus the partition number assignment.
#[derive(Debug, Clone)]
pub struct Layout {
    pub table: PartitionTable,
    pub partitions: PartitionNumbers,
    /// False when no entry was added and sfdisk need not run at all.
    pub needs_partitioning: bool,
}

/// Lay out ESP, swap, home, srv, root and verity, in that order, each only
/// if configured.
pub fn determine_layout(config: &BuildConfig) -> Result<Layout> {
    let mut table = PartitionTable::new();
    let mut partitions = PartitionNumbers::default();

    let entry = |size: u64, type_uuid: Uuid, name: &str| Partition {
        size: Some(size / 512),
        type_uuid: Some(type_uuid),
        name: Some(name.to_string()),
        ..Default::default()
    };

    if config.bootable {
        let esp_size = config.esp_size.context("Bootable image without ESP size")?;
        partitions.esp = Some(table.push(entry(esp_size, GPT_ESP, "ESP System Partition")));
    }

    if let Some(swap_size) = config.swap_size {
        partitions.swap = Some(table.push(entry(swap_size, GPT_SWAP, "Swap Partition")));
    }

    if config.format != OutputFormat::RawBtrfs {
        if let Some(home_size) = config.home_size {
            partitions.home = Some(table.push(entry(home_size, GPT_HOME, "Home Partition")));
        }
        if let Some(srv_size) = config.srv_size {
            partitions.srv = Some(table.push(entry(srv_size, GPT_SRV, "Server Data Partition")));
        }
    }

    // The root slot is numbered even when squashfs fills it in later.
    let root = table.next_number();
    if config.format != OutputFormat::RawSquashfs {
        let read_only = config.read_only && config.format != OutputFormat::RawBtrfs;
        table.push(Partition {
            type_uuid: Some(gpt_root_native(&config.architecture)?.root),
            name: Some("Root Partition".to_string()),
            attrs: read_only.then(|| ATTR_READ_ONLY.to_string()),
            ..Default::default()
        });
    }
    partitions.root = Some(root);

    if config.verity {
        partitions.verity = Some(root + 1);
    }

    let needs_partitioning = !table.is_empty();
    Ok(Layout {
        table,
        partitions,
        needs_partitioning,
    })
}

/// Initial size of the backing file for a raw image.
pub fn image_size(config: &BuildConfig) -> Result<u64> {
    let esp = if config.bootable { config.esp_size } else { None };
    [config.root_size, config.home_size, config.srv_size, esp, config.swap_size]
        .into_iter()
        .flatten()
        .try_fold(GPT_HEADER_SIZE + GPT_FOOTER_SIZE, u64::checked_add)
        .ok_or_else(|| MkosiError::config("Sum of partition sizes is too large.").into())
}

/// Per-partition LUKS header reserve when the whole disk is encrypted.
pub const LUKS_EXTRA: u64 = 2 * 1024 * 1024;

/// Sizes involved in growing an image by one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insertion {
    /// Blob size rounded up to a sector.
    pub blob_size: u64,
    /// Partition size in sectors, including the LUKS reserve.
    pub sectors: u64,
    /// New size of the backing file.
    pub new_file_size: u64,
}

/// Size math for appending a blob after `last_offset`.
pub fn plan_insertion(last_offset: u64, blob_len: u64, encrypt_all: bool) -> Insertion {
    let blob_size = roundup512(blob_len);
    let luks_extra = if encrypt_all { LUKS_EXTRA } else { 0 };
    Insertion {
        blob_size,
        sectors: (blob_size + luks_extra) / 512,
        new_file_size: last_offset + blob_size + luks_extra + GPT_FOOTER_SIZE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "\
label: gpt
label-id: 1A6B3F32-4D88-4B6B-8D0B-0F5E0C6B3C6A
device: /dev/loop0
unit: sectors
first-lba: 2048
last-lba: 2355166

/dev/loop0p1 : start=        2048, size=      524288, type=C12A7328-F81F-11D2-BA4B-00A0C93EC93B, uuid=6E1C5A52-0C3A-4B3E-9C61-3B0A0B5F1E11, name=\"ESP System Partition\"
/dev/loop0p2 : start=      526336, size=     1828831, type=4F68BCE3-E8CD-4DB1-96E7-FBCAF984B709, uuid=0E1C5A52-0C3A-4B3E-9C61-3B0A0B5F1E12, name=\"Root Partition\", attrs=\"GUID:60\"
";

    #[test]
    fn test_parse_dump() {
        let table = PartitionTable::parse_dump(DUMP).unwrap();
        assert_eq!(table.len(), 2);

        let esp = table.get(1).unwrap();
        assert_eq!(esp.start, Some(2048));
        assert_eq!(esp.size, Some(524288));
        assert_eq!(esp.type_uuid, Some(GPT_ESP));
        assert_eq!(esp.name.as_deref(), Some("ESP System Partition"));

        let root = table.get(2).unwrap();
        assert_eq!(root.attrs.as_deref(), Some("GUID:60"));
        assert_eq!(table.end_offset(), (526336 + 1828831) * 512);
        assert_eq!(table.next_number(), 3);
    }

    #[test]
    fn test_comma_in_name_is_split() {
        let dump = "\n/dev/loop0p1 : size=2048, name=\"a,b\"\n";
        let table = PartitionTable::parse_dump(dump).unwrap();
        assert_eq!(table.get(1).unwrap().name.as_deref(), Some("\"a"));
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("Root Partition"), "\"Root Partition\"");
        assert_eq!(quote("a\"b"), "\"a\\x22b\"");
        assert_eq!(quote("$HOME`"), "\"\\x24HOME\\x60\"");
        assert_eq!(quote("ä"), "\"\\xc3\\xa4\"");
    }

    #[test]
    fn test_unquote_reverses_quote() {
        for name in ["Root Partition", "a\"b\\c", "$x`y", "ümlaut"] {
            assert_eq!(unquote(&quote(name)), name);
        }
        assert_eq!(unquote("bare"), "bare");
    }

    #[test]
    fn test_partition_line() {
        let p = Partition {
            size: Some(2048),
            type_uuid: Some(GPT_SWAP),
            name: Some("Swap Partition".into()),
            attrs: Some(ATTR_READ_ONLY.into()),
            ..Default::default()
        };
        assert_eq!(
            p.to_string(),
            "size=2048, type=0657fd6d-a4ab-43c4-84e5-0933c84b4f4f, name=\"Swap Partition\", attrs=GUID:60"
        );
    }

    #[test]
    fn test_script_round_trip() {
        let mut table = PartitionTable::new();
        table.push(Partition {
            size: Some(524288),
            type_uuid: Some(GPT_ESP),
            name: Some("ESP System Partition".into()),
            ..Default::default()
        });
        let dump = format!("\n/dev/loop7p1 : {}\n", table.get(1).unwrap());
        assert_eq!(PartitionTable::parse_dump(&dump).unwrap(), table);
        assert!(table.to_script().starts_with("label: gpt\n"));
    }

    #[test]
    fn test_roundup512() {
        assert_eq!(roundup512(0), 0);
        assert_eq!(roundup512(1), 512);
        assert_eq!(roundup512(512), 512);
        assert_eq!(roundup512(513), 1024);
    }

    #[test]
    fn test_plan_insertion_with_luks() {
        let mib = 1024 * 1024;
        let plan = plan_insertion(GPT_HEADER_SIZE, 10 * mib, true);
        assert_eq!(plan.blob_size, 10 * mib);
        assert_eq!(plan.sectors * 512, 12 * mib);
        assert_eq!(plan.new_file_size, GPT_HEADER_SIZE + 12 * mib + GPT_FOOTER_SIZE);

        let plan = plan_insertion(GPT_HEADER_SIZE, 1000, false);
        assert_eq!(plan.blob_size, 1024);
        assert_eq!(plan.sectors, 2);
    }

    #[test]
    fn test_image_size_sums_enabled_partitions() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = crate::config::test_config(dir.path(), |s| {
            s.swap_size = Some("512M".to_string());
            s.esp_size = Some("256M".to_string());
        });
        // ESP only counts for bootable images.
        assert_eq!(
            image_size(&config).unwrap(),
            GPT_HEADER_SIZE + GPT_FOOTER_SIZE + (1024 + 512) * 1024 * 1024
        );
    }

    #[test]
    fn test_unknown_architecture() {
        assert!(gpt_root_native("riscv64").is_err());
        assert_eq!(gpt_root_native("aarch64").unwrap().verity, GPT_ROOT_ARM_64_VERITY);
    }
}
