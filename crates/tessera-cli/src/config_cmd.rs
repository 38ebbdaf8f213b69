use std::fs;
use std::path::PathBuf;

use tessera_ai::known_provider_ids;

use crate::config::default_key_env;
use crate::paths::TesseraPaths;

const TESSERA_TOML_SAMPLE: &str = include_str!("../../../tessera.toml.sample");

pub fn run_config_init(conf_dir: Option<PathBuf>) -> Result<(), String> {
    let paths = TesseraPaths::resolve(conf_dir.as_deref());

    for path in paths.init_directories() {
        fs::create_dir_all(&path)
            .map_err(|error| format!("create {} failed: {error}", path.display()))?;
        println!("created: {}", path.display());
    }

    let config_path = paths.config_file();
    if config_path.exists() {
        println!("kept: {}", config_path.display());
    } else {
        fs::write(&config_path, TESSERA_TOML_SAMPLE)
            .map_err(|error| format!("write {} failed: {error}", config_path.display()))?;
        println!("created: {}", config_path.display());
    }

    Ok(())
}

pub fn run_list_providers() -> Result<(), String> {
    for id in known_provider_ids() {
        match default_key_env(id) {
            Some(key) => println!("{id}\t{key}"),
            None => println!("{id}\t-"),
        }
    }
    Ok(())
}
