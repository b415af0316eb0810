use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

struct ClassDef {
    size: usize,
    batch_size: usize,
}

/// Batch size heuristic: small classes move 32 objects at a time, mid-size
/// classes move ~64 KiB worth, large classes at least 2.
fn auto_batch(size: usize, max_objects_to_move: usize) -> usize {
    let b = if size <= 1024 {
        32
    } else if size <= 4096 {
        (65536 / size).max(2)
    } else {
        (262144 / size).max(2)
    };
    b.min(max_objects_to_move)
}

#[derive(Deserialize, Default)]
struct ConfigSection {
    page_shift: Option<u32>,
    huge_page_shift: Option<u32>,
    min_cache_limit: Option<usize>,
    cache_time_ms: Option<u64>,
    fraction_to_release_percent: Option<usize>,
    cap_demand_interval_secs: Option<u64>,
    sharded_min_class_bytes: Option<usize>,
    sharded_capacity_bytes: Option<usize>,
    max_transfer_capacity_bytes: Option<usize>,
    max_objects_to_move: Option<usize>,
    cpu_setsize: Option<usize>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
    #[serde(default)]
    classes: Vec<usize>,
}

struct ResolvedConfig {
    page_shift: u32,
    huge_page_shift: u32,
    min_cache_limit: usize,
    cache_time_ms: u64,
    fraction_to_release_percent: usize,
    cap_demand_interval_secs: u64,
    sharded_min_class_bytes: usize,
    sharded_capacity_bytes: usize,
    max_transfer_capacity_bytes: usize,
    max_objects_to_move: usize,
    cpu_setsize: usize,
}

fn resolve_config(cfg: &ConfigSection) -> ResolvedConfig {
    let page_shift = cfg.page_shift.unwrap_or(12);
    let huge_page_shift = cfg.huge_page_shift.unwrap_or(21);
    assert!(
        (12..=16).contains(&page_shift),
        "page_shift ({}) must be in 12..=16",
        page_shift
    );
    assert!(
        huge_page_shift > page_shift,
        "huge_page_shift ({}) must be > page_shift ({})",
        huge_page_shift,
        page_shift
    );

    let min_cache_limit = cfg.min_cache_limit.unwrap_or(10);
    let cache_time_ms = cfg.cache_time_ms.unwrap_or(1000);
    let fraction_to_release_percent = cfg.fraction_to_release_percent.unwrap_or(20);
    let cap_demand_interval_secs = cfg.cap_demand_interval_secs.unwrap_or(300);
    let sharded_min_class_bytes = cfg.sharded_min_class_bytes.unwrap_or(4096);
    let sharded_capacity_bytes = cfg.sharded_capacity_bytes.unwrap_or(12 << 20);
    let max_transfer_capacity_bytes = cfg.max_transfer_capacity_bytes.unwrap_or(1 << 20);
    let max_objects_to_move = cfg.max_objects_to_move.unwrap_or(128);
    let cpu_setsize = cfg.cpu_setsize.unwrap_or(1024);

    assert!(min_cache_limit > 0, "min_cache_limit must be > 0");
    assert!(cache_time_ms > 0, "cache_time_ms must be > 0");
    assert!(
        (1..=100).contains(&fraction_to_release_percent),
        "fraction_to_release_percent ({}) must be in 1..=100",
        fraction_to_release_percent
    );
    assert!(
        cap_demand_interval_secs > 0,
        "cap_demand_interval_secs must be > 0"
    );
    assert!(
        sharded_min_class_bytes > 0,
        "sharded_min_class_bytes must be > 0"
    );
    assert!(
        sharded_capacity_bytes > 0,
        "sharded_capacity_bytes must be > 0"
    );
    assert!(
        max_transfer_capacity_bytes > 0,
        "max_transfer_capacity_bytes must be > 0"
    );
    assert!(max_objects_to_move > 0, "max_objects_to_move must be > 0");
    assert!(
        cpu_setsize > 0 && cpu_setsize.is_power_of_two(),
        "cpu_setsize ({}) must be a power of 2",
        cpu_setsize
    );

    ResolvedConfig {
        page_shift,
        huge_page_shift,
        min_cache_limit,
        cache_time_ms,
        fraction_to_release_percent,
        cap_demand_interval_secs,
        sharded_min_class_bytes,
        sharded_capacity_bytes,
        max_transfer_capacity_bytes,
        max_objects_to_move,
        cpu_setsize,
    }
}

fn parse_classes(config: &Config, max_objects_to_move: usize) -> Vec<ClassDef> {
    assert!(
        !config.classes.is_empty(),
        "RTCACHE_CONFIG: config must contain a `classes = [...]` entry"
    );
    let defs: Vec<ClassDef> = config
        .classes
        .iter()
        .map(|&size| ClassDef {
            size,
            batch_size: auto_batch(size, max_objects_to_move),
        })
        .collect();
    validate_classes(&defs);
    defs
}

fn validate_classes(defs: &[ClassDef]) {
    assert!(
        defs.len() < 256,
        "too many size classes ({}, max 255)",
        defs.len()
    );
    for (i, d) in defs.iter().enumerate() {
        assert!(d.size > 0, "class {}: size must be > 0", i);
        assert!(
            d.size % 8 == 0,
            "class {}: size {} must be 8-byte aligned",
            i,
            d.size
        );
        assert!(d.batch_size > 0, "class {}: batch_size must be > 0", i);
        if i > 0 {
            assert!(
                d.size > defs[i - 1].size,
                "class {}: size {} must be > previous size {}",
                i,
                d.size,
                defs[i - 1].size
            );
        }
    }
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{}/rtcache.toml", manifest_dir)
}

fn generate_config(cfg: &ResolvedConfig, out_path: &Path) {
    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         pub const PAGE_SHIFT: usize = {};\n\
         pub const PAGE_SIZE: usize = {};\n\
         pub const HUGE_PAGE_SHIFT: usize = {};\n\
         pub const HUGE_PAGE_SIZE: usize = {};\n\
         pub const PAGES_PER_HUGE_PAGE: usize = {};\n\
         pub const MIN_CACHE_LIMIT: usize = {};\n\
         pub const DEFAULT_CACHE_TIME_MS: u64 = {};\n\
         pub const FRACTION_TO_RELEASE_PERCENT: usize = {};\n\
         pub const CAP_DEMAND_INTERVAL_SECS: u64 = {};\n\
         pub const SHARDED_MIN_CLASS_BYTES: usize = {};\n\
         pub const SHARDED_CAPACITY_BYTES: usize = {};\n\
         pub const MAX_TRANSFER_CAPACITY_BYTES: usize = {};\n\
         pub const MAX_OBJECTS_TO_MOVE: usize = {};\n\
         pub const CPU_SETSIZE: usize = {};\n",
        cfg.page_shift,
        1usize << cfg.page_shift,
        cfg.huge_page_shift,
        1usize << cfg.huge_page_shift,
        1usize << (cfg.huge_page_shift - cfg.page_shift),
        cfg.min_cache_limit,
        cfg.cache_time_ms,
        cfg.fraction_to_release_percent,
        cfg.cap_demand_interval_secs,
        cfg.sharded_min_class_bytes,
        cfg.sharded_capacity_bytes,
        cfg.max_transfer_capacity_bytes,
        cfg.max_objects_to_move,
        cfg.cpu_setsize,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn generate_size_classes(defs: &[ClassDef], out_path: &Path) {
    let num_size_classes = defs.len() + 1;

    let mut code = String::from("// Auto-generated by build.rs. Do not edit.\n\n");
    code.push_str(&format!(
        "pub const NUM_SIZE_CLASSES: usize = {num_size_classes};\n\n\
         pub static SIZE_CLASSES: [SizeClassInfo; {num_size_classes}] = [\n\
         \x20   SizeClassInfo {{ size: 0, batch_size: 0 }}, // sentinel\n",
    ));
    for d in defs {
        code.push_str(&format!(
            "    SizeClassInfo {{ size: {}, batch_size: {} }},\n",
            d.size, d.batch_size
        ));
    }
    code.push_str("];\n");

    fs::write(out_path, code).expect("failed to write size_class_gen.rs");
}

fn main() {
    println!("cargo:rerun-if-env-changed=RTCACHE_CONFIG");

    let out_dir = env::var("OUT_DIR").unwrap();

    let config_path = env::var("RTCACHE_CONFIG").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={}", config_path);
    let content = fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", config_path, e));

    let config: Config = toml::from_str(&content).expect("failed to parse TOML config");

    let resolved = resolve_config(&config.config);
    let defs = parse_classes(&config, resolved.max_objects_to_move);

    generate_config(&resolved, &Path::new(&out_dir).join("config_gen.rs"));
    generate_size_classes(&defs, &Path::new(&out_dir).join("size_class_gen.rs"));
}
