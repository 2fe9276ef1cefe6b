//! keeper-release: fetch, verify and stage releases from a channel.
//!
//! [`ReleaseFetcher::fetch`] resolves a [`Channel`] to a descriptor, streams
//! every asset into `<staging>/<version>.partial/`, checks each against the
//! release's `sha256sum` manifest and only then promotes the directory and
//! writes its `.ready` marker. Anything short of that is discarded.

pub mod descriptor;
pub mod error;
pub mod fetcher;
pub mod manifest;
pub mod source;
pub mod staging;

pub use descriptor::{AssetRef, AssetRole, ReleaseDescriptor};
pub use error::{ReleaseError, ReleaseResult};
pub use fetcher::{Channel, ReleaseFetcher, VersionSelector};
pub use manifest::ChecksumManifest;
pub use source::{ChannelTransport, ReleaseSource};
pub use staging::{CandidateState, ReadyMarker, ReleaseCandidate, StagedAsset, StagingArea};
