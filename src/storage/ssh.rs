use std::path::PathBuf;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::spool::{open_detached, staging_path};
use super::{ByteStream, StorageBackend, StorageError, validate_key};
use crate::config::SshConfig;

/// `ssh` exits with 255 when the connection itself failed.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Archives on a remote host, driven through the system `ssh` client in
/// batch mode. Key-based authentication only.
pub struct SshBackend {
    config: SshConfig,
    staging_dir: PathBuf,
}

fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

impl SshBackend {
    pub fn new(config: SshConfig, staging_dir: PathBuf) -> Self {
        Self {
            config,
            staging_dir,
        }
    }

    fn remote_path(&self, key: &str) -> Result<String, StorageError> {
        validate_key(key)?;
        Ok(format!(
            "{}/{}",
            self.config.remote_path.trim_end_matches('/'),
            key
        ))
    }

    fn command(&self, remote: String) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-p")
            .arg(self.config.port.to_string())
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.connect_timeout_secs));
        if let Some(identity) = &self.config.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(format!("{}@{}", self.config.user, self.config.host))
            .arg("--")
            .arg(remote)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, remote: String, key: &str) -> Result<Output, StorageError> {
        debug!(host = %self.config.host, command = %remote, "ssh");
        let output = self
            .command(remote)
            .output()
            .await
            .map_err(|e| StorageError::Unavailable(format!("failed to spawn ssh: {}", e)))?;
        check(&output, key)?;
        Ok(output)
    }
}

/// Map a finished ssh invocation onto the storage failure taxonomy.
fn classify(code: Option<i32>, stderr: &str, key: &str) -> StorageError {
    let stderr = stderr.trim();
    if stderr.contains("Permission denied") {
        return StorageError::PermissionDenied(format!("{}: {}", key, stderr));
    }
    match code {
        Some(SSH_TRANSPORT_FAILURE) | None => {
            StorageError::Unavailable(format!("ssh transport: {}", stderr))
        }
        Some(_) if stderr.contains("No such file") => StorageError::NotFound(key.to_string()),
        Some(code) => StorageError::Io(std::io::Error::other(format!(
            "remote command exited {}: {}",
            code, stderr
        ))),
    }
}

fn check(output: &Output, key: &str) -> Result<(), StorageError> {
    if output.status.success() {
        return Ok(());
    }
    Err(classify(
        output.status.code(),
        &String::from_utf8_lossy(&output.stderr),
        key,
    ))
}

#[async_trait]
impl StorageBackend for SshBackend {
    fn kind(&self) -> &'static str {
        "ssh"
    }

    async fn put(&self, key: &str, mut data: ByteStream) -> Result<(), StorageError> {
        let path = self.remote_path(key)?;
        let partial = format!("{}.partial", path);
        let dir = path.rsplit_once('/').map(|(d, _)| d).unwrap_or(".");
        let remote = format!(
            "mkdir -p {dir} && cat > {partial} && mv -f {partial} {path}",
            dir = sh_quote(dir),
            partial = sh_quote(&partial),
            path = sh_quote(&path),
        );

        let mut child = self
            .command(remote)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| StorageError::Unavailable(format!("failed to spawn ssh: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| StorageError::Io(std::io::Error::other("ssh stdin unavailable")))?;
        let copied = tokio::io::copy(&mut data, &mut stdin).await;
        drop(stdin);

        let output = child.wait_with_output().await?;
        // A transport failure closes stdin early; prefer the exit status.
        check(&output, key)?;
        copied?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<ByteStream, StorageError> {
        let path = self.remote_path(key)?;
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let local = staging_path(&self.staging_dir, "ssh-get");

        let mut child = self
            .command(format!("cat {}", sh_quote(&path)))
            .spawn()
            .map_err(|e| StorageError::Unavailable(format!("failed to spawn ssh: {}", e)))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| StorageError::Io(std::io::Error::other("ssh stdout unavailable")))?;
        let mut file = tokio::fs::File::create(&local).await?;
        let copied = tokio::io::copy(&mut stdout, &mut file).await;
        file.flush().await?;
        drop(file);

        let output = child.wait_with_output().await?;
        if let Err(e) = check(&output, key).and(copied.map(|_| ()).map_err(StorageError::Io)) {
            let _ = tokio::fs::remove_file(&local).await;
            return Err(e);
        }

        Ok(open_detached(&local).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let root = sh_quote(&self.config.remote_path);
        let remote = format!(
            "if [ -d {root} ]; then cd {root} && find . -type f ! -name '*.partial'; fi"
        );
        let output = self.run(remote, prefix).await?;

        let mut keys: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|line| line.trim_start_matches("./").to_string())
            .filter(|k| !k.is_empty() && k.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.remote_path(key)?;
        let remote = format!(
            "rm -f {} {}",
            sh_quote(&path),
            sh_quote(&format!("{}.partial", path))
        );
        self.run(remote, key).await.map(|_| ())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.remote_path(key)?;
        let output = self
            .command(format!("test -f {}", sh_quote(&path)))
            .output()
            .await
            .map_err(|e| StorageError::Unavailable(format!("failed to spawn ssh: {}", e)))?;

        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(classify(
                output.status.code(),
                &String::from_utf8_lossy(&output.stderr),
                key,
            )),
        }
    }

    async fn test_connection(&self) -> Result<(), StorageError> {
        self.run("true".to_string(), &self.config.host).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> SshBackend {
        SshBackend::new(
            SshConfig {
                id: "vault".into(),
                host: "vault.internal".into(),
                port: 2222,
                user: "backup".into(),
                identity_file: Some(PathBuf::from("/etc/cbkd/id_ed25519")),
                remote_path: "/srv/backups/".into(),
                connect_timeout_secs: 5,
            },
            std::env::temp_dir(),
        )
    }

    #[test]
    fn quotes_single_quotes() {
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn remote_paths_join_under_root() {
        let b = backend();
        assert_eq!(
            b.remote_path("web1/x/archive.cbk.gz").unwrap(),
            "/srv/backups/web1/x/archive.cbk.gz"
        );
        assert!(b.remote_path("../../etc/shadow").is_err());
    }

    #[test]
    fn command_runs_in_batch_mode() {
        let cmd = backend().command("true".into());
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=5".to_string()));
        assert!(args.contains(&"backup@vault.internal".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("true"));
    }

    #[test]
    fn classifies_failures() {
        assert!(classify(Some(255), "ssh: connect to host vault port 22: Connection refused", "k")
            .is_retryable());
        assert!(matches!(
            classify(Some(255), "backup@vault: Permission denied (publickey).", "k"),
            StorageError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify(Some(1), "cat: /srv/x: No such file or directory", "k"),
            StorageError::NotFound(_)
        ));
        assert!(matches!(
            classify(Some(1), "mv: cannot move: disk full", "k"),
            StorageError::Io(_)
        ));
    }
}
