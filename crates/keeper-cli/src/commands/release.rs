use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use keeper_core::KeeperConfig;
use keeper_release::{Channel, ChannelTransport, ReleaseFetcher};

use super::{emit, human_bytes};
use crate::Format;

pub async fn fetch(config: &KeeperConfig, format: Format) -> anyhow::Result<ExitCode> {
    let release = config
        .release
        .as_ref()
        .context("no [release] section in the configuration")?;
    let channel = Channel::from_config(release)?;
    let transport =
        ChannelTransport::with_credential_file(release.credential_file.as_deref(), release.timeout()?)?;
    let fetcher = ReleaseFetcher::new(Arc::new(transport), &config.paths.staging_dir);

    let candidate = fetcher
        .fetch(&channel)
        .await
        .with_context(|| format!("fetching {} from channel {}", channel.version, channel.name))?;

    emit(format, &candidate, |c| {
        println!(
            "✓ {} ready in {} ({} asset(s), {})",
            c.version,
            c.staging_dir.display(),
            c.assets.len(),
            human_bytes(c.staged_bytes())
        );
    })?;
    Ok(ExitCode::SUCCESS)
}
