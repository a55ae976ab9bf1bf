//! Configuration for the provisioning engine.

mod config;
pub use config::{
    config_schema_json, load_config, parse_config, write_schema_file, Config, KubeConfig,
    PrometheusConfig, ProxyConfig, ReconcileConfig, SqlConfig,
};

/// Resolve a config file path independent of the current working directory.
///
/// Tries `DAAS_CONFIG_DIR`, then the working directory, then the directory of
/// the running executable.
pub fn resolve_config_path(rel: &str) -> Option<std::path::PathBuf> {
    let candidates = std::env::var("DAAS_CONFIG_DIR")
        .ok()
        .map(|dir| std::path::Path::new(&dir).join(rel))
        .into_iter()
        .chain(std::env::current_dir().ok().map(|dir| dir.join(rel)))
        .chain(
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|dir| dir.join(rel))),
        );
    for candidate in candidates {
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}
