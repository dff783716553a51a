//! `init`: scaffold project configuration.

use anyhow::{bail, Context, Result};

use crate::cli::output;
use crate::domain::models::Config;

const CONFIG_PATH: &str = ".necrocode/config.yaml";

pub async fn handle_init(force: bool, json: bool) -> Result<()> {
    let path = std::path::Path::new(CONFIG_PATH);
    if path.exists() && !force {
        bail!("{CONFIG_PATH} already exists (use --force to overwrite)");
    }

    tokio::fs::create_dir_all(".necrocode").await.context("failed to create .necrocode")?;
    let config = Config::default();
    let yaml = serde_yaml::to_string(&config).context("failed to render default config")?;
    tokio::fs::write(path, format!("# NecroCode configuration. Values here merge over built-in\n# defaults; NECROCODE_* environment variables win over both.\n{yaml}"))
        .await
        .context("failed to write config")?;

    if json {
        output::print_json(&serde_json::json!({"created": CONFIG_PATH}))?;
    } else {
        output::success(&format!("wrote {CONFIG_PATH}"));
        output::note("edit it, then create a pool with `necrocode pool create`");
    }
    Ok(())
}
