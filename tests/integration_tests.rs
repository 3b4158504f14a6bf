//! End-to-end tests over the public API that need neither root nor block
//! devices: layout planning, cache decisions, tree post-processing,
//! output bookkeeping and the summary.

mod helpers;

use helpers::{assert_file_contains, assert_file_exists, create_mock_root, exit_code, TestEnv};
use mkosi::cache;
use mkosi::clean;
use mkosi::common::Workspace;
use mkosi::config::Verb;
use mkosi::context::{BuildContext, Pass};
use mkosi::gpt::{self, GPT_ESP, GPT_FOOTER_SIZE};
use mkosi::output;
use mkosi::sources::{copy_filtered_tree, SourceFilter};
use mkosi::summary;
use mkosi::tree;
use mkosi::verity;
use regex::Regex;
use std::fs;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

// =============================================================================
// Partition layout
// =============================================================================

#[test]
fn test_layout_root_only() {
    let env = TestEnv::new();
    let config = env.config(|s| s.root_size = Some("1G".to_string()));
    let layout = gpt::determine_layout(&config).unwrap();

    assert_eq!(layout.table.len(), 1);
    assert!(layout.needs_partitioning);
    assert_eq!(layout.partitions.esp, None);
    assert_eq!(layout.partitions.root, Some(1));
    let root = layout.table.get(1).unwrap();
    assert_eq!(root.name.as_deref(), Some("Root Partition"));
    assert_eq!(config.root_size, Some(GIB));
}

#[test]
fn test_layout_bootable_esp_first() {
    let env = TestEnv::new();
    let config = env.config(|s| {
        s.bootable = Some(true);
        s.esp_size = Some("256M".to_string());
        s.root_size = Some("1G".to_string());
    });
    let layout = gpt::determine_layout(&config).unwrap();

    assert_eq!(layout.table.len(), 2);
    assert_eq!(layout.partitions.esp, Some(1));
    assert_eq!(layout.partitions.root, Some(2));
    let esp = layout.table.get(1).unwrap();
    assert_eq!(esp.type_uuid, Some(GPT_ESP));
    assert_eq!(esp.size, Some(256 * MIB / 512));
}

#[test]
fn test_layout_order_without_gaps() {
    let env = TestEnv::new();
    let config = env.config(|s| {
        s.bootable = Some(true);
        s.swap_size = Some("512M".to_string());
        s.home_size = Some("1G".to_string());
        s.srv_size = Some("1G".to_string());
        s.verity = Some(true);
    });
    let p = gpt::determine_layout(&config).unwrap().partitions;
    assert_eq!(
        [p.esp, p.swap, p.home, p.srv, p.root, p.verity],
        [Some(1), Some(2), Some(3), Some(4), Some(5), Some(6)]
    );
}

#[test]
fn test_layout_squashfs_reserves_root_slot() {
    let env = TestEnv::new();
    let config = env.config(|s| {
        s.format = Some("raw_squashfs".to_string());
        s.home_size = Some("64M".to_string());
    });
    let layout = gpt::determine_layout(&config).unwrap();
    assert_eq!(layout.table.len(), 1);
    assert_eq!(layout.partitions.home, Some(1));
    assert_eq!(layout.partitions.root, Some(2));
}

#[test]
fn test_layout_btrfs_keeps_home_and_srv_in_root() {
    let env = TestEnv::new();
    let config = env.config(|s| {
        s.format = Some("raw_btrfs".to_string());
        s.home_size = Some("64M".to_string());
        s.srv_size = Some("64M".to_string());
    });
    let p = gpt::determine_layout(&config).unwrap().partitions;
    assert_eq!((p.home, p.srv, p.root), (None, None, Some(1)));
}

#[test]
fn test_insertion_with_luks_reserve() {
    let plan = gpt::plan_insertion(GIB, 10 * MIB, true);
    assert_eq!(plan.sectors * 512, gpt::roundup512(10 * MIB) + 2 * MIB);
    assert_eq!(plan.new_file_size, GIB + 10 * MIB + 2 * MIB + GPT_FOOTER_SIZE);

    let plain = gpt::plan_insertion(GIB, 1000, false);
    assert_eq!(plain.blob_size, 1024);
    assert_eq!(plain.sectors, 2);
}

// =============================================================================
// Verity
// =============================================================================

#[test]
fn test_uuids_derived_from_root_hash() {
    let hash = "0123456789abcdef0123456789abcdeffedcba9876543210fedcba9876543210";
    let output = format!("VERITY header information for /dev/loop0p2\nRoot hash:      \t{}\n", hash);
    let parsed = verity::parse_root_hash(&output).unwrap();
    assert_eq!(parsed, hash);

    let root = verity::root_uuid(&parsed).unwrap();
    let verity = verity::verity_uuid(&parsed).unwrap();
    assert_eq!(root.simple().to_string(), &hash[..32]);
    assert_eq!(verity.simple().to_string(), &hash[32..]);
    assert_ne!(root, verity);
    assert!(verity::parse_root_hash("no hash here\n").is_none());
}

// =============================================================================
// Incremental cache
// =============================================================================

#[test]
fn test_existing_caches_skip_cache_passes() {
    let env = TestEnv::new();
    let config = env.config(|s| s.incremental = Some(true));
    fs::write(config.cache_pre_dev.as_ref().unwrap(), "").unwrap();
    fs::write(config.cache_pre_inst.as_ref().unwrap(), "").unwrap();

    assert!(!cache::need_cache_images(&config));

    // A cache pass with a snapshot in place produces nothing.
    let mut ctx = BuildContext::new(config, 0o022);
    let workspace = Workspace::in_dir(&env.base).unwrap();
    let out = mkosi::pipeline::build_image(&mut ctx, &workspace, Pass::new(false, true)).unwrap();
    assert!(out.raw.is_none() && out.tar.is_none());
}

#[test]
fn test_double_force_rebuilds_caches() {
    let env = TestEnv::new();
    let config = env.config(|s| {
        s.incremental = Some(true);
        s.force_count = 2;
    });
    fs::write(config.cache_pre_dev.as_ref().unwrap(), "").unwrap();
    fs::write(config.cache_pre_inst.as_ref().unwrap(), "").unwrap();
    assert!(cache::need_cache_images(&config));
}

// =============================================================================
// Tree post-processing
// =============================================================================

#[test]
fn test_empty_password_clears_root_field() {
    let env = TestEnv::new();
    let ctx = BuildContext::new(env.config(|s| s.password = Some(String::new())), 0o022);
    let workspace = Workspace::in_dir(&env.base).unwrap();
    create_mock_root(&workspace.root());

    tree::set_root_password(&ctx, &workspace, Pass::FINAL).unwrap();

    let passwd = fs::read_to_string(workspace.root().join("etc/passwd")).unwrap();
    assert_eq!(
        passwd,
        "root::0:0:root:/root:/bin/bash\nbin:x:1:1:bin:/bin:/sbin/nologin\nrootless:x:1000:1000::/home/rootless:/bin/bash\n"
    );
    assert_file_contains(&workspace.root().join("etc/shadow"), "root:!locked:");
}

#[test]
fn test_machine_id_and_random_seed_reset() {
    let env = TestEnv::new();
    let workspace = Workspace::in_dir(&env.base).unwrap();
    let root = workspace.root();
    create_mock_root(&root);
    fs::write(root.join("etc/machine-id"), "0123456789abcdef0123456789abcdef\n").unwrap();
    fs::create_dir_all(root.join("var/lib/systemd")).unwrap();
    fs::write(root.join("var/lib/systemd/random-seed"), "seed").unwrap();

    tree::reset_machine_id(&workspace, Pass::FINAL).unwrap();
    tree::reset_random_seed(&workspace).unwrap();

    assert_eq!(fs::read_to_string(root.join("etc/machine-id")).unwrap(), "");
    assert!(!root.join("var/lib/systemd/random-seed").exists());
}

// =============================================================================
// Build sources
// =============================================================================

#[test]
fn test_source_tree_copy_skips_internal_paths() {
    let env = TestEnv::new();
    env.write("src/main.c", "int main(void) { return 0; }\n");
    env.write(".git/HEAD", "ref: refs/heads/main\n");
    env.write(".mkosi-scratch/junk", "");
    env.write("mkosi.builddir/obj.o", "");
    env.write("image.raw.cache-pre-inst", "");
    let config = env.config(|_| {});

    let dest = env._temp_dir.path().join("copy");
    copy_filtered_tree(&env.base, &dest, &SourceFilter::new(&config)).unwrap();

    assert_file_exists(&dest.join("src/main.c"));
    assert!(!dest.join(".git").exists());
    assert!(!dest.join(".mkosi-scratch").exists());
    assert!(!dest.join("mkosi.builddir").exists());
    assert!(!dest.join("image.raw.cache-pre-inst").exists());
}

// =============================================================================
// Outputs
// =============================================================================

#[test]
fn test_existing_output_needs_force() {
    let env = TestEnv::new();
    let config = env.config(|s| s.bmap = Some(true));
    fs::write(env.base.join("image.raw.bmap"), "").unwrap();

    assert_eq!(exit_code(output::check_output(&config)), 3);

    let forced = env.config(|s| {
        s.bmap = Some(true);
        s.force_count = 1;
    });
    clean::unlink_output(&forced).unwrap();
    output::check_output(&forced).unwrap();
}

#[test]
fn test_clean_levels_differ_by_verb() {
    let build = clean::clean_level(Verb::Build, 2);
    assert!(build.build_cache && !build.package_cache);

    let clean = clean::clean_level(Verb::Clean, 2);
    assert!(clean.build_cache && clean.package_cache);

    let once = clean::clean_level(Verb::Build, 1);
    assert!(!once.build_cache && !once.package_cache);
}

// =============================================================================
// Summary
// =============================================================================

#[test]
fn test_summary_layout() {
    let env = TestEnv::new();
    let config = env.config(|s| {
        s.bootable = Some(true);
        s.encrypt = Some("data".to_string());
        s.home_size = Some("64M".to_string());
        s.password = Some("secret".to_string());
        s.packages = vec!["vim".to_string()];
    });
    let text = summary::render(&config);

    let sections: Vec<&str> = text
        .lines()
        .filter(|l| !l.starts_with(' ') && l.ends_with(':'))
        .collect();
    assert_eq!(
        sections,
        ["DISTRIBUTION:", "OUTPUT:", "PACKAGES:", "PARTITIONS:", "VALIDATION:", "HOST CONFIGURATION:"]
    );

    let field = Regex::new(r"^ *[A-Za-z/][A-Za-z/ .-]*: .*$").unwrap();
    for line in text.lines().filter(|l| l.starts_with(' ')) {
        assert!(field.is_match(line), "malformed summary line: {:?}", line);
        assert_eq!(line.find(": "), Some(22), "misaligned summary line: {:?}", line);
    }

    assert!(text.contains("            Encryption: data\n"));
    assert!(text.contains("       /home Partition: 64.0M\n"));
    assert!(text.contains("              Password: set\n"));
    assert!(text.contains("       UEFI SecureBoot: no\n"));
    assert!(!text.contains("secret"));
}

#[test]
fn test_summary_json_omits_secrets() {
    let env = TestEnv::new();
    let config = env.config(|s| {
        s.format = Some("directory".to_string());
        s.password = Some("secret".to_string());
    });
    let json = summary::to_json(&config).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();

    assert_eq!(value["format"], "directory");
    assert_eq!(value["verb"], "build");
    assert!(value.get("password").is_none());
    assert!(!json.contains("secret"));
}
