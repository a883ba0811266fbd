//! Output writer: commits drafts to the knowledge vault.
//!
//! Notes are rendered as YAML frontmatter plus a markdown body. Every path
//! written for a message is recorded in `vault_outputs` under a role
//! (`note`, `artifact`, `sync`), which gives two guarantees:
//!
//! - reprocessing a message overwrites its own files instead of creating
//!   a second note
//! - a path owned by anything else (another message, a file the user made)
//!   is never overwritten; the new file gets a ` (2)`, ` (3)` suffix
//!
//! Files are written to a temporary name in the destination directory and
//! renamed into place, so a crash mid-write never leaves a truncated note.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::config::Config;
use crate::models::VaultNote;
use crate::pipelines::Draft;

const MAX_SUFFIX: usize = 1000;

/// Absolute paths produced by one commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Written {
    pub note: PathBuf,
    pub artifact: Option<PathBuf>,
    pub synced: Option<PathBuf>,
}

impl Written {
    pub fn paths(&self) -> Vec<String> {
        std::iter::once(&self.note)
            .chain(self.artifact.as_ref())
            .chain(self.synced.as_ref())
            .map(|p| p.display().to_string())
            .collect()
    }
}

#[derive(Clone)]
pub struct VaultWriter {
    root: PathBuf,
    sync_dir: Option<PathBuf>,
    pool: SqlitePool,
}

impl VaultWriter {
    pub fn new(config: &Config, pool: SqlitePool) -> Self {
        Self {
            root: config.vault.root.clone(),
            sync_dir: config.sync.target_dir.clone(),
            pool,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a draft's artifact, note and sync copy.
    pub async fn commit(&self, message_id: &str, draft: &Draft) -> Result<Written> {
        let mut body = draft.note.body.clone();
        let mut written = Written::default();

        if let Some((rel, attachment)) = &draft.artifact {
            let target = self.claim(message_id, "artifact", &self.root, rel).await?;
            write_atomic(&target, &attachment.bytes).await?;
            let wanted = file_name(rel);
            let got = file_name(&target);
            if wanted != got {
                body = body.replace(&format!("[[{}]]", wanted), &format!("[[{}]]", got));
            }
            written.artifact = Some(target);
        }

        let note = VaultNote {
            path: draft.note.path.clone(),
            frontmatter: draft.note.frontmatter.clone(),
            body,
        };
        let note_path = self.claim(message_id, "note", &self.root, &note.path).await?;
        write_atomic(&note_path, render(&note)?.as_bytes()).await?;
        written.note = note_path;

        if let (true, Some(sync_dir)) = (draft.sync, &self.sync_dir) {
            let (source, rel) = match (&written.artifact, &draft.artifact) {
                (Some(path), Some((rel, _))) => (path.clone(), rel.clone()),
                _ => (written.note.clone(), draft.note.path.clone()),
            };
            let target = self.claim(message_id, "sync", sync_dir, &rel).await?;
            let bytes = tokio::fs::read(&source)
                .await
                .with_context(|| format!("reading {}", source.display()))?;
            write_atomic(&target, &bytes).await?;
            debug!(message_id, path = %target.display(), "synced");
            written.synced = Some(target);
        }

        info!(message_id, note = %written.note.display(), pipeline = %draft.pipeline, "committed to vault");
        Ok(written)
    }

    /// Pick the path for `(message_id, role)`: the wanted path if free or
    /// already ours, otherwise the first free suffixed variant. Releases a
    /// stale path this message wrote earlier under another name.
    async fn claim(&self, message_id: &str, role: &str, base: &Path, rel: &Path) -> Result<PathBuf> {
        check_relative(rel)?;
        let wanted = base.join(rel);
        let own: Option<String> = sqlx::query("SELECT path FROM vault_outputs WHERE message_id = ? AND role = ?")
            .bind(message_id)
            .bind(role)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.get("path"));

        let mut chosen = None;
        for n in 1..=MAX_SUFFIX {
            let candidate = if n == 1 { wanted.clone() } else { suffixed(&wanted, n) };
            let key = candidate.display().to_string();
            if own.as_deref() == Some(key.as_str()) {
                chosen = Some(candidate);
                break;
            }
            let owner: Option<String> = sqlx::query("SELECT message_id FROM vault_outputs WHERE path = ?")
                .bind(&key)
                .fetch_optional(&self.pool)
                .await?
                .map(|row| row.get("message_id"));
            if owner.is_none() && !tokio::fs::try_exists(&candidate).await.unwrap_or(true) {
                chosen = Some(candidate);
                break;
            }
        }
        let Some(chosen) = chosen else {
            bail!("no free path for {} after {} attempts", wanted.display(), MAX_SUFFIX);
        };

        let key = chosen.display().to_string();
        if let Some(stale) = own.filter(|p| *p != key) {
            match tokio::fs::remove_file(&stale).await {
                Ok(()) => debug!(message_id, path = %stale, "removed stale output"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("removing {}", stale)),
            }
        }

        sqlx::query(
            r#"
            INSERT INTO vault_outputs (message_id, role, path, written_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(message_id, role) DO UPDATE SET path = excluded.path, written_at = excluded.written_at
            "#,
        )
        .bind(message_id)
        .bind(role)
        .bind(&key)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(chosen)
    }

    /// Paths recorded for a message, by role.
    pub async fn outputs(&self, message_id: &str) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT role, path FROM vault_outputs WHERE message_id = ? ORDER BY role")
            .bind(message_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| (r.get("role"), r.get("path"))).collect())
    }
}

/// `---\n<yaml>---\n\n<body>\n`
pub fn render(note: &VaultNote) -> Result<String> {
    let yaml = serde_yaml::to_string(&note.frontmatter).context("serialising frontmatter")?;
    let mut out = String::with_capacity(yaml.len() + note.body.len() + 16);
    out.push_str("---\n");
    out.push_str(&yaml);
    out.push_str("---\n\n");
    out.push_str(note.body.trim_end());
    out.push('\n');
    Ok(out)
}

/// Split a rendered note back into frontmatter and body.
pub fn parse_note(text: &str) -> Result<(serde_yaml::Mapping, String)> {
    let Some(rest) = text.strip_prefix("---\n") else {
        bail!("note has no frontmatter");
    };
    let Some(end) = rest.find("\n---\n") else {
        bail!("unterminated frontmatter");
    };
    let frontmatter: serde_yaml::Mapping = serde_yaml::from_str(&rest[..end + 1])?;
    let body = rest[end + 5..].trim_start_matches('\n').to_string();
    Ok((frontmatter, body))
}

fn check_relative(rel: &Path) -> Result<()> {
    if rel.as_os_str().is_empty() || rel.components().any(|c| !matches!(c, Component::Normal(_))) {
        bail!("refusing to write outside the vault: {}", rel.display());
    }
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
}

/// `dir/name.ext` → `dir/name (n).ext`
fn suffixed(path: &Path, n: usize) -> PathBuf {
    let stem = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{} ({}).{}", stem, n, ext.to_string_lossy()),
        None => format!("{} ({})", stem, n),
    };
    path.with_file_name(name)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("no parent directory for {}", path.display()))?;
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let tmp = dir.join(format!(".{}.{}.tmp", file_name(path), uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e).with_context(|| format!("renaming into {}", path.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Attachment, Pipeline};
    use serde_yaml::{Mapping, Value as Yaml};
    use tempfile::TempDir;

    async fn writer(tmp: &TempDir, sync: bool) -> VaultWriter {
        let mut toml = format!(
            "[db]\npath = \"{}\"\n[vault]\nroot = \"{}\"\n",
            tmp.path().join("vault.sqlite").display(),
            tmp.path().join("vault").display()
        );
        if sync {
            toml.push_str(&format!("[sync]\ntarget_dir = \"{}\"\n", tmp.path().join("sync").display()));
        }
        let cfg = crate::config::parse_config(&toml).unwrap();
        VaultWriter::new(&cfg, crate::db::open(&cfg).await.unwrap())
    }

    fn draft(path: &str, body: &str, artifact: Option<&str>, sync: bool) -> Draft {
        let mut fm = Mapping::new();
        fm.insert(Yaml::from("tags"), Yaml::from(vec!["a".to_string()]));
        Draft {
            pipeline: Pipeline::Note,
            title: "t".into(),
            note: VaultNote {
                path: PathBuf::from(path),
                frontmatter: fm,
                body: body.into(),
            },
            artifact: artifact.map(|a| {
                (
                    PathBuf::from(a),
                    Attachment {
                        filename: file_name(Path::new(a)),
                        mime: Some("application/pdf".into()),
                        bytes: b"%PDF-1.4".to_vec(),
                    },
                )
            }),
            sync,
        }
    }

    #[tokio::test]
    async fn renders_frontmatter_and_body() {
        let tmp = TempDir::new().unwrap();
        let w = writer(&tmp, false).await;
        let out = w.commit("m1", &draft("Inbox/n.md", "hello", None, false)).await.unwrap();
        let text = std::fs::read_to_string(&out.note).unwrap();
        assert_eq!(text, "---\ntags:\n- a\n---\n\nhello\n");
        let (fm, body) = parse_note(&text).unwrap();
        assert_eq!(body, "hello\n");
        assert!(fm.contains_key("tags"));
    }

    #[tokio::test]
    async fn reprocessing_overwrites_own_note() {
        let tmp = TempDir::new().unwrap();
        let w = writer(&tmp, false).await;
        let first = w.commit("m1", &draft("Inbox/n.md", "v1", None, false)).await.unwrap();
        let second = w.commit("m1", &draft("Inbox/n.md", "v2", None, false)).await.unwrap();
        assert_eq!(first.note, second.note);
        let entries: Vec<_> = std::fs::read_dir(tmp.path().join("vault/Inbox")).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert!(std::fs::read_to_string(&second.note).unwrap().contains("v2"));
    }

    #[tokio::test]
    async fn renamed_output_replaces_stale_file() {
        let tmp = TempDir::new().unwrap();
        let w = writer(&tmp, false).await;
        let first = w.commit("m1", &draft("Inbox/old.md", "v1", None, false)).await.unwrap();
        let second = w.commit("m1", &draft("Inbox/new.md", "v2", None, false)).await.unwrap();
        assert!(!first.note.exists());
        assert!(second.note.exists());
    }

    #[tokio::test]
    async fn foreign_collisions_get_suffixes() {
        let tmp = TempDir::new().unwrap();
        let w = writer(&tmp, false).await;
        std::fs::create_dir_all(tmp.path().join("vault/Inbox")).unwrap();
        std::fs::write(tmp.path().join("vault/Inbox/n.md"), "user file").unwrap();

        let a = w.commit("m1", &draft("Inbox/n.md", "a", None, false)).await.unwrap();
        let b = w.commit("m2", &draft("Inbox/n.md", "b", None, false)).await.unwrap();
        assert_eq!(file_name(&a.note), "n (2).md");
        assert_eq!(file_name(&b.note), "n (3).md");
        assert_eq!(std::fs::read_to_string(tmp.path().join("vault/Inbox/n.md")).unwrap(), "user file");
    }

    #[tokio::test]
    async fn artifact_links_follow_renames_and_sync_copies() {
        let tmp = TempDir::new().unwrap();
        let w = writer(&tmp, true).await;
        std::fs::create_dir_all(tmp.path().join("vault/Archive")).unwrap();
        std::fs::write(tmp.path().join("vault/Archive/doc.pdf"), "other").unwrap();

        let out = w
            .commit("m1", &draft("Archive/doc.md", "text\n\n[[doc.pdf]]", Some("Archive/doc.pdf"), true))
            .await
            .unwrap();
        let artifact = out.artifact.clone().unwrap();
        assert_eq!(file_name(&artifact), "doc (2).pdf");
        assert!(std::fs::read_to_string(&out.note).unwrap().contains("[[doc (2).pdf]]"));
        let synced = out.synced.clone().unwrap();
        assert!(synced.starts_with(tmp.path().join("sync")));
        assert_eq!(std::fs::read(&synced).unwrap(), b"%PDF-1.4");
        assert_eq!(out.paths().len(), 3);
        assert_eq!(w.outputs("m1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn rejects_paths_outside_the_vault() {
        let tmp = TempDir::new().unwrap();
        let w = writer(&tmp, false).await;
        assert!(w.commit("m1", &draft("../escape.md", "x", None, false)).await.is_err());
        assert!(w.commit("m1", &draft("/etc/x.md", "x", None, false)).await.is_err());
    }
}
