//! Locating migration scripts on the filesystem or inside an archive.
//!
//! Filenames follow `<digits>-<name>.(up|down)[.no-tx].sql`. The leading
//! digits become the migration id (ordinarily a UTC `yyyyMMddHHmmss`
//! timestamp); the `up` and `down` halves of one id are paired into a single
//! [`MigrationDescriptor`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use percent_encoding::percent_decode_str;
use regex::Regex;
use walkdir::WalkDir;

use crate::error::{MigrateResult, MigrationError};

/// Which [`crate::kind::MigrationKind`] a descriptor should be compiled into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    /// Backed by `up_sql`/`down_sql` parsed from files.
    Sql,
    /// Backed by a user-registered code migration, looked up by id.
    Code,
}

/// An id-ordered, parsed migration file, not yet compiled into a
/// [`crate::kind::MigrationKind`].
#[derive(Debug, Clone)]
pub struct MigrationDescriptor {
    /// Numeric id parsed from the filename.
    pub id: i64,
    /// The `<name>` segment, kebab-case preserved.
    pub name: String,
    /// Contents of the `.up.sql` file, if found.
    pub up_sql: Option<String>,
    /// Contents of the `.down.sql` file, if found.
    pub down_sql: Option<String>,
    /// True unless either half carried the `.no-tx.sql` suffix.
    pub transactional: bool,
    /// Which migration kind this descriptor compiles into.
    pub kind: DescriptorKind,
}

fn filename_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)-(.+)\.(up|down)(\.no-tx)?\.sql$").unwrap())
}

struct ParsedName {
    id: i64,
    name: String,
    direction: &'static str,
    transactional: bool,
}

fn parse_filename(filename: &str) -> Option<ParsedName> {
    let caps = filename_re().captures(filename)?;
    let id: i64 = caps.get(1)?.as_str().parse().ok()?;
    let name = caps.get(2)?.as_str().to_string();
    let direction = if &caps[3] == "up" { "up" } else { "down" };
    let transactional = caps.get(4).is_none();
    Some(ParsedName {
        id,
        name,
        direction,
        transactional,
    })
}

/// Normalize a raw filesystem or archive entry name: decode percent-escapes
/// and flip backslashes to forward slashes, matching how filenames may be
/// produced by build tools running on non-Unix hosts.
pub fn normalize_path_component(raw: &str) -> String {
    let decoded = percent_decode_str(raw).decode_utf8_lossy();
    decoded.replace('\\', "/")
}

fn fold_in(
    descriptors: &mut BTreeMap<i64, MigrationDescriptor>,
    parsed: ParsedName,
    contents: String,
) {
    let entry = descriptors.entry(parsed.id).or_insert_with(|| MigrationDescriptor {
        id: parsed.id,
        name: parsed.name.clone(),
        up_sql: None,
        down_sql: None,
        transactional: true,
        kind: DescriptorKind::Sql,
    });

    if !parsed.transactional {
        entry.transactional = false;
    }

    if parsed.direction == "up" {
        entry.up_sql = Some(contents);
    } else {
        entry.down_sql = Some(contents);
    }
}

/// Try `<parent>/<dir>` first, falling back to `<dir>` as a plain relative
/// path. Returns `None` if neither exists.
pub fn resolve_migration_dir(parent: &Path, dir: &str) -> Option<PathBuf> {
    let nested = parent.join(dir);
    if nested.exists() {
        return Some(nested);
    }
    let plain = PathBuf::from(dir);
    if plain.exists() {
        return Some(plain);
    }
    None
}

/// Where a migration set resolved to: a plain directory, or an archive file
/// whose entries should be streamed instead of read as directory entries.
#[derive(Debug, Clone)]
pub enum MigrationSource {
    Directory(PathBuf),
    /// `dir_name` is the in-archive directory prefix to strip, or empty when
    /// the archive's top level already holds the migration files.
    Archive { path: PathBuf, dir_name: String },
}

/// Resolve `<parent>/<dir>` or `<dir>`, same search order as
/// [`resolve_migration_dir`], but additionally recognizing an archive file
/// (`.zip`/`.jar`) at any point along that search as the migration source.
pub fn resolve_migration_source(parent: &Path, dir: &str) -> Option<MigrationSource> {
    if parent.is_file() {
        return Some(MigrationSource::Archive {
            path: parent.to_path_buf(),
            dir_name: dir.to_string(),
        });
    }
    let nested = parent.join(dir);
    if nested.is_dir() {
        return Some(MigrationSource::Directory(nested));
    }
    if nested.is_file() {
        return Some(MigrationSource::Archive {
            path: nested,
            dir_name: String::new(),
        });
    }
    let plain = PathBuf::from(dir);
    if plain.is_dir() {
        return Some(MigrationSource::Directory(plain));
    }
    if plain.is_file() {
        return Some(MigrationSource::Archive {
            path: plain,
            dir_name: String::new(),
        });
    }
    None
}

/// Discover migration descriptors from a resolved [`MigrationSource`],
/// dispatching to [`discover_filesystem`] or [`discover_archive`].
pub async fn discover(
    source: &MigrationSource,
    exclude: &[String],
) -> MigrateResult<BTreeMap<i64, MigrationDescriptor>> {
    match source {
        MigrationSource::Directory(dir) => discover_filesystem(dir, exclude).await,
        MigrationSource::Archive { path, dir_name } => {
            let path = path.clone();
            let dir_name = dir_name.clone();
            let exclude = exclude.to_vec();
            tokio::task::spawn_blocking(move || discover_archive(&path, &dir_name, &exclude))
                .await
                .map_err(|e| MigrationError::Other(e.to_string()))?
        }
    }
}

/// Walk a filesystem directory and parse every matching migration file.
/// Non-matching files are skipped with a warning, not an error.
pub async fn discover_filesystem(
    dir: &Path,
    exclude: &[String],
) -> MigrateResult<BTreeMap<i64, MigrationDescriptor>> {
    if !dir.exists() {
        return Err(MigrationError::DirectoryNotFound(dir.display().to_string()));
    }

    let dir = dir.to_path_buf();
    let exclude = exclude.to_vec();

    let paths: Vec<PathBuf> = tokio::task::spawn_blocking(move || {
        WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect()
    })
    .await
    .map_err(|e| MigrationError::Other(e.to_string()))?;

    let mut descriptors = BTreeMap::new();
    for path in paths {
        let Some(filename) = path.file_name().and_then(|f| f.to_str()) else {
            continue;
        };
        let normalized = normalize_path_component(filename);
        if exclude.iter().any(|x| x == &normalized) {
            continue;
        }

        let Some(parsed) = parse_filename(&normalized) else {
            tracing::warn!(file = %normalized, "skipping file that does not match the migration filename grammar");
            continue;
        };

        let contents = tokio::fs::read_to_string(&path).await.map_err(MigrationError::Io)?;
        fold_in(&mut descriptors, parsed, contents);
    }

    Ok(descriptors)
}

/// Stream migration entries out of a zip/jar archive without extracting it
/// to disk. `archive_dir` is the directory prefix inside the archive whose
/// entries should be parsed (e.g. `"migrations"`).
pub fn discover_archive(
    archive_path: &Path,
    archive_dir: &str,
    exclude: &[String],
) -> MigrateResult<BTreeMap<i64, MigrationDescriptor>> {
    let file = std::fs::File::open(archive_path).map_err(MigrationError::Io)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| MigrationError::Archive(e.to_string()))?;

    let prefix = if archive_dir.is_empty() {
        String::new()
    } else {
        format!("{}/", archive_dir.trim_end_matches('/'))
    };
    let mut descriptors = BTreeMap::new();

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| MigrationError::Archive(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let raw_name = entry.name().to_string();
        let normalized = normalize_path_component(&raw_name);
        let stripped = if prefix.is_empty() {
            normalized.as_str()
        } else {
            match normalized.strip_prefix(&prefix) {
                Some(s) => s,
                None => continue,
            }
        };
        if exclude.iter().any(|x| x == stripped) {
            continue;
        }

        let Some(parsed) = parse_filename(stripped) else {
            tracing::warn!(entry = %stripped, "skipping archive entry that does not match the migration filename grammar");
            continue;
        };

        let mut contents = String::new();
        std::io::Read::read_to_string(&mut entry, &mut contents).map_err(MigrationError::Io)?;
        fold_in(&mut descriptors, parsed, contents);
    }

    Ok(descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn parses_standard_filename() {
        let parsed = parse_filename("20240101120000-create-users.up.sql").unwrap();
        assert_eq!(parsed.id, 20240101120000);
        assert_eq!(parsed.name, "create-users");
        assert_eq!(parsed.direction, "up");
        assert!(parsed.transactional);
    }

    #[test]
    fn parses_no_tx_suffix() {
        let parsed = parse_filename("1-x.down.no-tx.sql").unwrap();
        assert_eq!(parsed.id, 1);
        assert!(!parsed.transactional);
        assert_eq!(parsed.direction, "down");
    }

    #[test]
    fn rejects_non_matching_names() {
        assert!(parse_filename("README.md").is_none());
        assert!(parse_filename("not-a-migration.sql").is_none());
    }

    #[test]
    fn resolve_prefers_nested_dir() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("resources").join("migrations");
        std::fs::create_dir_all(&nested).unwrap();

        let resolved = resolve_migration_dir(&tmp.path().join("resources"), "migrations");
        assert_eq!(resolved, Some(nested));
    }

    #[tokio::test]
    async fn discover_filesystem_pairs_up_and_down() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("1-create-users.up.sql"),
            "CREATE TABLE users(id int);",
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("1-create-users.down.sql"),
            "DROP TABLE users;",
        )
        .unwrap();
        std::fs::write(tmp.path().join("ignored.txt"), "not a migration").unwrap();

        let descriptors = discover_filesystem(tmp.path(), &[]).await.unwrap();
        assert_eq!(descriptors.len(), 1);
        let d = &descriptors[&1];
        assert_eq!(d.name, "create-users");
        assert!(d.up_sql.as_deref().unwrap().contains("CREATE TABLE"));
        assert!(d.down_sql.as_deref().unwrap().contains("DROP TABLE"));
    }

    #[tokio::test]
    async fn discover_filesystem_missing_dir_is_an_error() {
        let missing = Path::new("/nonexistent/migrations/path/xyz");
        let result = discover_filesystem(missing, &[]).await;
        assert!(matches!(result, Err(MigrationError::DirectoryNotFound(_))));
    }

    #[tokio::test]
    async fn discover_filesystem_one_sided_migration_leaves_other_side_none() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("2-add-column.up.sql"), "ALTER TABLE t ADD c int;").unwrap();

        let descriptors = discover_filesystem(tmp.path(), &[]).await.unwrap();
        let d = &descriptors[&2];
        assert!(d.up_sql.is_some());
        assert!(d.down_sql.is_none());
    }

    fn write_archive(path: &Path, prefix: &str) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();

        zip.start_file(format!("{prefix}1-create-users.up.sql"), options).unwrap();
        zip.write_all(b"CREATE TABLE users(id int);").unwrap();
        zip.start_file(format!("{prefix}1-create-users.down.sql"), options).unwrap();
        zip.write_all(b"DROP TABLE users;").unwrap();
        zip.finish().unwrap();
    }

    #[test]
    fn discover_archive_pairs_up_and_down() {
        let tmp = TempDir::new().unwrap();
        let archive_path = tmp.path().join("migrations.zip");
        write_archive(&archive_path, "migrations/");

        let descriptors = discover_archive(&archive_path, "migrations", &[]).unwrap();
        assert_eq!(descriptors.len(), 1);
        let d = &descriptors[&1];
        assert_eq!(d.name, "create-users");
        assert!(d.up_sql.as_deref().unwrap().contains("CREATE TABLE"));
        assert!(d.down_sql.as_deref().unwrap().contains("DROP TABLE"));
    }

    #[tokio::test]
    async fn resolve_migration_source_detects_archive_file() {
        let tmp = TempDir::new().unwrap();
        let archive_path = tmp.path().join("migrations.zip");
        write_archive(&archive_path, "");

        let source = resolve_migration_source(tmp.path(), "migrations.zip").unwrap();
        let descriptors = match &source {
            MigrationSource::Archive { dir_name, .. } => {
                assert_eq!(dir_name, "");
                discover(&source, &[]).await.unwrap()
            }
            MigrationSource::Directory(_) => panic!("expected an archive source"),
        };
        assert_eq!(descriptors.len(), 1);
    }

    #[tokio::test]
    async fn resolve_migration_source_prefers_directory_when_present() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("resources").join("migrations");
        std::fs::create_dir_all(&nested).unwrap();

        let source = resolve_migration_source(&tmp.path().join("resources"), "migrations").unwrap();
        assert!(matches!(source, MigrationSource::Directory(dir) if dir == nested));
    }
}
