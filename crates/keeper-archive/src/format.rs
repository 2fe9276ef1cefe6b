//! On-disk archive format.
//!
//! An archive is a gzip-compressed tar whose first member is
//! [`MANIFEST_MEMBER`], a JSON [`Manifest`] describing every other member,
//! the chain linkage, and the paths deleted since the parent. The manifest
//! is what makes chains structural: a reader never has to infer lineage
//! from timestamps.

use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tar::{EntryType, Header};
use tracing::debug;

use crate::error::{ArchiveError, ArchiveResult, io_err};
use crate::scan::{EntryKind, Fingerprint, member_path};

pub const MANIFEST_MEMBER: &str = ".keeper/manifest.json";
pub const FORMAT_VERSION: u32 = 1;
pub const ARCHIVE_EXT: &str = "archive";
pub const CHECKSUM_EXT: &str = "checksum";

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%6fZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
    Full,
    Incremental,
}

impl ArchiveKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ArchiveKind::Full => "full",
            ArchiveKind::Incremental => "incremental",
        }
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header member of every archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub format: u32,
    pub kind: ArchiveKind,
    pub name: String,
    /// Archive this one is incremental against. `None` for a full archive.
    pub parent: Option<String>,
    /// Full archive at the root of this archive's chain.
    pub chain_root: String,
    pub created_at: DateTime<Utc>,
    /// Member names of the target roots.
    pub targets: Vec<String>,
    /// Roots that did not exist when the archive was taken.
    #[serde(default)]
    pub absent_targets: Vec<String>,
    pub entries: std::collections::BTreeMap<String, Fingerprint>,
    #[serde(default)]
    pub deleted: Vec<String>,
}

/// Where restored members are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Back to the absolute paths they were archived from.
    InPlace,
    /// Re-rooted under the given directory.
    Under(PathBuf),
}

impl Destination {
    pub fn resolve(&self, name: &str) -> ArchiveResult<PathBuf> {
        match self {
            Destination::InPlace => member_path(Path::new("/"), name),
            Destination::Under(base) => member_path(base, name),
        }
    }
}

/// File name for a new archive.
pub fn archive_name(kind: ArchiveKind, at: DateTime<Utc>) -> String {
    format!("{}_{}.{ARCHIVE_EXT}", kind, at.format(TIMESTAMP_FORMAT))
}

/// Parse the kind out of a conforming archive file name.
pub fn parse_archive_name(name: &str) -> Option<ArchiveKind> {
    let stem = name.strip_suffix(&format!(".{ARCHIVE_EXT}"))?;
    let (kind, ts) = stem.split_once('_')?;
    let kind = match kind {
        "full" => ArchiveKind::Full,
        "incremental" => ArchiveKind::Incremental,
        _ => return None,
    };
    let b = ts.as_bytes();
    let well_formed = b.len() == 22
        && b[..8].iter().all(u8::is_ascii_digit)
        && b[8] == b'T'
        && b[9..21].iter().all(u8::is_ascii_digit)
        && b[21] == b'Z';
    well_formed.then_some(kind)
}

/// Sidecar path for an archive: `{kind}_{timestamp}.checksum`.
pub fn checksum_path(archive: &Path) -> PathBuf {
    archive.with_extension(CHECKSUM_EXT)
}

/// Write a `sha256sum`-compatible sidecar for `archive`.
pub fn write_checksum(archive: &Path, digest: &str) -> ArchiveResult<()> {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sidecar = checksum_path(archive);
    keeper_core::fsutil::write_atomic(&sidecar, format!("{digest}  {name}\n").as_bytes())
        .map_err(io_err(format!("failed to write {}", sidecar.display())))
}

/// Digest recorded in an archive's sidecar.
pub fn read_checksum(archive: &Path) -> ArchiveResult<String> {
    let sidecar = checksum_path(archive);
    let text = fs::read_to_string(&sidecar)
        .map_err(io_err(format!("failed to read {}", sidecar.display())))?;
    let digest = text.split_whitespace().next().unwrap_or_default();
    if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ArchiveError::integrity(&sidecar, "malformed checksum sidecar"));
    }
    Ok(digest.to_ascii_lowercase())
}

/// Re-hash an archive and compare it with its sidecar.
pub fn verify_checksum(archive: &Path) -> ArchiveResult<String> {
    let expected = read_checksum(archive)?;
    let actual = keeper_core::fsutil::sha256_file(archive)
        .map_err(io_err(format!("failed to hash {}", archive.display())))?;
    if actual != expected {
        return Err(ArchiveError::integrity(
            archive,
            format!("checksum mismatch: sidecar {expected}, actual {actual}"),
        ));
    }
    Ok(actual)
}

/// Write `manifest` and the members it lists to `dest`.
///
/// Members are read from their live absolute paths. The file is synced
/// before returning but is not yet trusted: callers must run
/// [`verify_archive`] before publishing it.
pub fn write_archive(dest: &Path, manifest: &Manifest) -> ArchiveResult<()> {
    let ctx = || format!("failed to write archive {}", dest.display());
    let file = File::create(dest).map_err(io_err(ctx()))?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    let mtime = manifest.created_at.timestamp().max(0) as u64;

    let json = serde_json::to_vec_pretty(manifest)
        .map_err(|e| ArchiveError::Serialize(e.to_string()))?;
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    header.set_size(json.len() as u64);
    builder
        .append_data(&mut header, MANIFEST_MEMBER, json.as_slice())
        .map_err(io_err(ctx()))?;

    for (name, fp) in &manifest.entries {
        let source = member_path(Path::new("/"), name)?;
        let mut header = Header::new_gnu();
        header.set_mode(fp.mode);
        header.set_mtime(mtime);
        header.set_uid(0);
        header.set_gid(0);
        match fp.kind {
            EntryKind::Dir => {
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                builder
                    .append_data(&mut header, name, io::empty())
                    .map_err(io_err(ctx()))?;
            }
            EntryKind::File => {
                header.set_entry_type(EntryType::Regular);
                header.set_size(fp.size);
                let file = File::open(&source)
                    .map_err(io_err(format!("failed to open {}", source.display())))?;
                builder
                    .append_data(&mut header, name, file.take(fp.size))
                    .map_err(io_err(ctx()))?;
            }
            EntryKind::Symlink => {
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                let target = fp.link.as_deref().unwrap_or_default();
                builder
                    .append_link(&mut header, name, target)
                    .map_err(io_err(ctx()))?;
            }
        }
    }

    let encoder = builder.into_inner().map_err(io_err(ctx()))?;
    let writer = encoder.finish().map_err(io_err(ctx()))?;
    let file = writer.into_inner().map_err(|e| io_err(ctx())(e.into_error()))?;
    file.sync_all().map_err(io_err(ctx()))?;
    Ok(())
}

fn open_archive(path: &Path) -> ArchiveResult<tar::Archive<GzDecoder<BufReader<File>>>> {
    let file =
        File::open(path).map_err(io_err(format!("failed to open archive {}", path.display())))?;
    Ok(tar::Archive::new(GzDecoder::new(BufReader::new(file))))
}

fn member_name_of<R: Read>(entry: &tar::Entry<'_, R>) -> io::Result<String> {
    let path = entry.path()?;
    Ok(path.to_string_lossy().trim_end_matches('/').to_string())
}

/// Read only the manifest member of an archive.
pub fn read_manifest(path: &Path) -> ArchiveResult<Manifest> {
    let bad = |reason: String| ArchiveError::integrity(path, reason);
    let mut archive = open_archive(path)?;
    let mut entries = archive.entries().map_err(|e| bad(e.to_string()))?;
    let mut first = entries
        .next()
        .ok_or_else(|| bad("archive is empty".to_string()))?
        .map_err(|e| bad(e.to_string()))?;
    let name = member_name_of(&first).map_err(|e| bad(e.to_string()))?;
    if name != MANIFEST_MEMBER {
        return Err(bad(format!("first member is {name:?}, not the manifest")));
    }
    let mut json = Vec::new();
    first
        .read_to_end(&mut json)
        .map_err(|e| bad(e.to_string()))?;
    let manifest: Manifest =
        serde_json::from_slice(&json).map_err(|e| bad(format!("unreadable manifest: {e}")))?;
    if manifest.format != FORMAT_VERSION {
        return Err(bad(format!("unsupported format version {}", manifest.format)));
    }
    Ok(manifest)
}

/// Full read-back pass: decompress every member, re-hash every file, and
/// require the member set to equal the manifest's entry set.
pub fn verify_archive(path: &Path, expected: &Manifest) -> ArchiveResult<()> {
    let bad = |reason: String| ArchiveError::integrity(path, reason);
    let found = read_manifest(path)?;
    if &found != expected {
        return Err(bad("manifest differs from the one written".to_string()));
    }

    let mut archive = open_archive(path)?;
    let mut seen = BTreeSet::new();
    {
        let entries = archive.entries().map_err(|e| bad(e.to_string()))?;
        for entry in entries.skip(1) {
            let mut entry = entry.map_err(|e| bad(e.to_string()))?;
            let name = member_name_of(&entry).map_err(|e| bad(e.to_string()))?;
            let fp = expected
                .entries
                .get(&name)
                .ok_or_else(|| bad(format!("unexpected member {name:?}")))?;
            if !seen.insert(name.clone()) {
                return Err(bad(format!("duplicate member {name:?}")));
            }
            let entry_type = entry.header().entry_type();
            match fp.kind {
                EntryKind::File => {
                    if !entry_type.is_file() {
                        return Err(bad(format!("{name:?} is not a regular file")));
                    }
                    let mut hasher = Sha256::new();
                    let size = io::copy(&mut entry, &mut hasher).map_err(|e| bad(e.to_string()))?;
                    let digest = hex::encode(hasher.finalize());
                    if size != fp.size || Some(&digest) != fp.sha256.as_ref() {
                        return Err(bad(format!("content of {name:?} does not match manifest")));
                    }
                }
                EntryKind::Dir => {
                    if !entry_type.is_dir() {
                        return Err(bad(format!("{name:?} is not a directory")));
                    }
                }
                EntryKind::Symlink => {
                    let link = entry
                        .link_name()
                        .map_err(|e| bad(e.to_string()))?
                        .map(|l| l.to_string_lossy().into_owned());
                    if !entry_type.is_symlink() || link != fp.link {
                        return Err(bad(format!("symlink {name:?} does not match manifest")));
                    }
                }
            }
        }
    }
    if seen.len() != expected.entries.len() {
        return Err(bad(format!(
            "{} of {} members present",
            seen.len(),
            expected.entries.len()
        )));
    }

    // Drain to EOF so the gzip trailer CRC is checked as well.
    let mut rest = archive.into_inner();
    io::copy(&mut rest, &mut io::sink()).map_err(|e| bad(e.to_string()))?;
    debug!(archive = %path.display(), members = seen.len(), "archive read-back verified");
    Ok(())
}

/// Remove a file, symlink or directory tree. Missing paths are fine.
pub(crate) fn remove_path(path: &Path) -> ArchiveResult<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            Err(io_err(format!("failed to remove {}", path.display()))(e))
        }
        _ => Ok(()),
    }
}

/// Counts from applying one archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnpackStats {
    pub written: usize,
    pub removed: usize,
}

/// Apply one archive at `dest`.
///
/// Paths listed under `deleted` are removed first. With `replace_targets`
/// every target root (present or absent at archive time) is removed before
/// members are written, so the result equals exactly the archived tree.
pub fn unpack_archive(
    path: &Path,
    dest: &Destination,
    replace_targets: bool,
) -> ArchiveResult<(Manifest, UnpackStats)> {
    let manifest = read_manifest(path)?;
    let mut stats = UnpackStats::default();

    if replace_targets {
        for target in manifest.targets.iter().chain(&manifest.absent_targets) {
            remove_path(&dest.resolve(target)?)?;
            stats.removed += 1;
        }
    }
    for gone in &manifest.deleted {
        remove_path(&dest.resolve(gone)?)?;
        stats.removed += 1;
    }

    let mut archive = open_archive(path)?;
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    let entries = archive
        .entries()
        .map_err(|e| ArchiveError::integrity(path, e.to_string()))?;
    for entry in entries.skip(1) {
        let mut entry = entry.map_err(|e| ArchiveError::integrity(path, e.to_string()))?;
        let name =
            member_name_of(&entry).map_err(|e| ArchiveError::integrity(path, e.to_string()))?;
        let target = dest.resolve(&name)?;
        let is_dir_entry = entry.header().entry_type().is_dir();
        if let Ok(meta) = fs::symlink_metadata(&target) {
            if !(is_dir_entry && meta.is_dir()) {
                remove_path(&target)?;
            }
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(io_err(format!("failed to create {}", parent.display())))?;
        }
        entry
            .unpack(&target)
            .map_err(io_err(format!("failed to restore {}", target.display())))?;
        stats.written += 1;
    }
    debug!(
        archive = %path.display(),
        written = stats.written,
        removed = stats.removed,
        "archive applied"
    );
    Ok((manifest, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn archive_names_round_trip_kind() {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 5).unwrap();
        let name = archive_name(ArchiveKind::Incremental, at);
        assert_eq!(name, "incremental_20261019T083005000000Z.archive");
        assert_eq!(parse_archive_name(&name), Some(ArchiveKind::Incremental));
        assert_eq!(
            checksum_path(Path::new("/b").join(&name).as_path()),
            PathBuf::from("/b/incremental_20261019T083005000000Z.checksum")
        );
    }

    #[test]
    fn non_conforming_names_are_ignored() {
        assert_eq!(parse_archive_name("full_latest.archive"), None);
        assert_eq!(parse_archive_name("partial_20261019T083005000000Z.archive"), None);
        assert_eq!(parse_archive_name(".full_20261019T083005000000Z.archive.tmp"), None);
        assert_eq!(
            parse_archive_name("full_20261019T083005000000Z.archive"),
            Some(ArchiveKind::Full)
        );
    }

    #[test]
    fn checksum_sidecar_is_sha256sum_compatible() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("full_20261019T083005000000Z.archive");
        fs::write(&archive, b"payload").unwrap();
        let digest = keeper_core::fsutil::sha256_file(&archive).unwrap();
        write_checksum(&archive, &digest).unwrap();

        let text = fs::read_to_string(checksum_path(&archive)).unwrap();
        assert_eq!(text, format!("{digest}  full_20261019T083005000000Z.archive\n"));
        assert_eq!(verify_checksum(&archive).unwrap(), digest);

        fs::write(&archive, b"tampered").unwrap();
        assert!(matches!(
            verify_checksum(&archive),
            Err(ArchiveError::Integrity { .. })
        ));
    }

    #[test]
    fn destination_rejects_escaping_members() {
        let dest = Destination::Under(PathBuf::from("/restore"));
        assert!(dest.resolve("../../etc").is_err());
        assert_eq!(
            Destination::InPlace.resolve("opt/app").unwrap(),
            PathBuf::from("/opt/app")
        );
    }
}
