//! Fetching from a release mirror on local (removable) media.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use keeper_core::ReleaseConfig;
use keeper_core::fsutil::sha256_bytes;
use keeper_release::{AssetRole, Channel, ChannelTransport, ReleaseError, ReleaseFetcher};

fn write_mirror(root: &Path, version: &str, payload: &[u8]) {
    let dir = root.join("stable").join(version);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("capture.tar.gz"), payload).unwrap();
    fs::write(dir.join("post-install.sh"), "#!/bin/sh\nexit 0\n").unwrap();
    fs::write(
        dir.join("SHA256SUMS"),
        format!(
            "{}  capture.tar.gz\n{}  post-install.sh\n",
            sha256_bytes(payload),
            sha256_bytes(b"#!/bin/sh\nexit 0\n")
        ),
    )
    .unwrap();
    let descriptor = format!(
        r#"{{
  "version": "{version}",
  "assets": [
    {{"name": "capture.tar.gz", "uri": "capture.tar.gz", "role": "payload"}},
    {{"name": "post-install.sh", "uri": "post-install.sh", "role": "hook"}}
  ],
  "checksumManifest": "SHA256SUMS"
}}"#
    );
    fs::write(dir.join("release.json"), descriptor).unwrap();
}

fn config(mirror: &Path, version: &str) -> ReleaseConfig {
    ReleaseConfig {
        channel: "stable".into(),
        endpoint: format!("file://{}", mirror.display()),
        version: version.into(),
        credential_file: None,
        timeout: "10s".into(),
    }
}

#[tokio::test]
async fn pinned_release_is_staged_from_a_file_mirror() {
    let mirror = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    write_mirror(mirror.path(), "3.0.1", b"new build");

    let channel = Channel::from_config(&config(mirror.path(), "v3.0.1")).unwrap();
    let transport = ChannelTransport::new(None, Duration::from_secs(10)).unwrap();
    let fetcher = ReleaseFetcher::new(Arc::new(transport), staging.path());

    let candidate = fetcher.fetch(&channel).await.unwrap();
    assert_eq!(candidate.version, "3.0.1");
    assert_eq!(candidate.hook().map(|h| h.name.as_str()), Some("post-install.sh"));
    assert_eq!(candidate.assets_with_role(AssetRole::Payload).count(), 1);
    assert_eq!(
        fs::read(staging.path().join("3.0.1/capture.tar.gz")).unwrap(),
        b"new build"
    );

    // The mirror can go away once the version is staged.
    drop(mirror);
    let again = fetcher.fetch(&channel).await.unwrap();
    assert_eq!(again, candidate);
}

#[tokio::test]
async fn corrupted_mirror_copy_is_rejected() {
    let mirror = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    write_mirror(mirror.path(), "3.0.1", b"new build");
    fs::write(mirror.path().join("stable/3.0.1/capture.tar.gz"), b"bit rot").unwrap();

    let channel = Channel::from_config(&config(mirror.path(), "3.0.1")).unwrap();
    let transport = ChannelTransport::new(None, Duration::from_secs(10)).unwrap();
    let fetcher = ReleaseFetcher::new(Arc::new(transport), staging.path());

    let err = fetcher.fetch(&channel).await.unwrap_err();
    assert!(matches!(err, ReleaseError::VerificationFailed { .. }));
    assert_eq!(fs::read_dir(staging.path()).unwrap().count(), 0);
}
