use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

/// Payload granule of the thunk heap. Must match `heap::GRANULE`.
const GRANULE: usize = 16;

#[derive(Deserialize, Default)]
struct ConfigSection {
    region_size: Option<usize>,
    registry_capacity: Option<usize>,
    min_split: Option<usize>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
}

struct ResolvedConfig {
    region_size: usize,
    registry_capacity: usize,
    min_split: usize,
}

fn resolve_config(cfg: &ConfigSection) -> ResolvedConfig {
    // 0 means "one OS page", resolved at runtime.
    let region_size = cfg.region_size.unwrap_or(0);
    if region_size != 0 {
        assert!(
            region_size % GRANULE == 0,
            "region_size ({}) must be a multiple of {}",
            region_size,
            GRANULE
        );
        assert!(
            region_size >= 4 * GRANULE,
            "region_size ({}) must be >= {}",
            region_size,
            4 * GRANULE
        );
    }

    let registry_capacity = cfg.registry_capacity.unwrap_or(32);
    assert!(
        registry_capacity >= 4 && registry_capacity.is_power_of_two(),
        "registry_capacity ({}) must be a power of 2 and >= 4",
        registry_capacity
    );

    let min_split = cfg.min_split.unwrap_or(32);
    assert!(min_split > 0, "min_split must be > 0");
    assert!(
        min_split % GRANULE == 0,
        "min_split ({}) must be a multiple of {}",
        min_split,
        GRANULE
    );

    ResolvedConfig {
        region_size,
        registry_capacity,
        min_split,
    }
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{}/thunkmem.toml", manifest_dir)
}

fn generate_config(cfg: &ResolvedConfig, out_path: &Path) {
    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         /// Bytes reserved per thunk region (0 = one OS page).\n\
         pub const REGION_SIZE: usize = {};\n\
         /// Initial number of slots in the metadata registry.\n\
         pub const REGISTRY_CAPACITY: usize = {};\n\
         /// Smallest leftover payload that is split off into its own free block.\n\
         pub const MIN_SPLIT: usize = {};\n",
        cfg.region_size, cfg.registry_capacity, cfg.min_split,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn main() {
    println!("cargo:rerun-if-env-changed=THUNKMEM_CONFIG");

    let out_dir = env::var("OUT_DIR").unwrap();

    let config_path = env::var("THUNKMEM_CONFIG").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={}", config_path);
    let config: Config = match fs::read_to_string(&config_path) {
        Ok(content) => toml::from_str(&content)
            .unwrap_or_else(|e| panic!("failed to parse {}: {}", config_path, e)),
        Err(_) => Config::default(),
    };

    let resolved = resolve_config(&config.config);
    generate_config(&resolved, &Path::new(&out_dir).join("config_gen.rs"));
}
