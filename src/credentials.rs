use crate::error::SupervisorError;
use rand::rngs::OsRng;
use rand::Rng;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use zeroize::Zeroizing;

const PASSWORD_LEN: usize = 24;
const HASH_DEADLINE: Duration = Duration::from_secs(10);

// Printable and safe inside shell single quotes and control-port double
// quotes: no `'`, `"`, backslash or whitespace.
const ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!#$%&()*+,-./:;<=>?@[]^_{}~";

/// Control-port credentials for one run. The plaintext lives in a zeroizing
/// buffer and is dropped with the supervisor; only the hashed form is ever
/// rendered into a config file.
pub struct Credentials {
    pub plaintext: Zeroizing<String>,
    pub hashed: String,
}

impl Credentials {
    pub async fn materialize(tor_bin: &Path) -> Result<Self, SupervisorError> {
        let plaintext = generate_password();
        let hashed = derive_hash(tor_bin, &plaintext).await?;
        Ok(Self { plaintext, hashed })
    }
}

pub fn generate_password() -> Zeroizing<String> {
    let mut rng = OsRng;
    let mut out = Zeroizing::new(String::with_capacity(PASSWORD_LEN));
    for _ in 0..PASSWORD_LEN {
        let idx = rng.gen_range(0..ALPHABET.len());
        out.push(ALPHABET[idx] as char);
    }
    out
}

/// Ask the router binary to hash the control password. The secret is written
/// to the child's stdin (`--hash-password -`) so it never appears in an argv.
pub async fn derive_hash(tor_bin: &Path, plaintext: &str) -> Result<String, SupervisorError> {
    let mut child = Command::new(tor_bin)
        .args(["--hash-password", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| {
            SupervisorError::CredentialDerivationFailed(format!(
                "failed to spawn {}: {}",
                tor_bin.display(),
                err
            ))
        })?;

    let mut stdin = child.stdin.take().ok_or_else(|| {
        SupervisorError::CredentialDerivationFailed("router child has no stdin".into())
    })?;
    stdin
        .write_all(plaintext.as_bytes())
        .await
        .map_err(|err| SupervisorError::CredentialDerivationFailed(err.to_string()))?;
    stdin
        .write_all(b"\n")
        .await
        .map_err(|err| SupervisorError::CredentialDerivationFailed(err.to_string()))?;
    drop(stdin);

    let output = tokio::time::timeout(HASH_DEADLINE, child.wait_with_output())
        .await
        .map_err(|_| {
            SupervisorError::CredentialDerivationFailed("hash subcommand timed out".into())
        })?
        .map_err(|err| SupervisorError::CredentialDerivationFailed(err.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SupervisorError::CredentialDerivationFailed(format!(
            "hash subcommand exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    // The router prints startup notices before the hash; the hash is the
    // last non-empty stdout line.
    let stdout = String::from_utf8_lossy(&output.stdout);
    let hashed = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
        .to_string();
    if hashed.is_empty() {
        return Err(SupervisorError::CredentialDerivationFailed(
            "hash subcommand produced no output".into(),
        ));
    }
    Ok(hashed)
}

#[cfg(test)]
mod tests {
    use super::{derive_hash, generate_password, PASSWORD_LEN};
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn stub_router(dir: &tempfile::TempDir, script: &str) -> PathBuf {
        let path = dir.path().join("tor-stub");
        let mut file = std::fs::File::create(&path).expect("create stub");
        writeln!(file, "#!/bin/sh\n{}", script).expect("write stub");
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod stub");
        path
    }

    #[test]
    fn password_is_long_and_quote_safe() {
        let password = generate_password();
        assert_eq!(password.len(), PASSWORD_LEN);
        assert!(password.len() >= 16);
        assert!(!password.contains('\''));
        assert!(!password.contains('"'));
        assert!(!password.contains('\\'));
        assert!(password.chars().all(|c| c.is_ascii_graphic()));
    }

    #[test]
    fn consecutive_passwords_differ() {
        let first = generate_password();
        let second = generate_password();
        assert_ne!(*first, *second);
    }

    #[tokio::test]
    async fn hash_is_read_from_last_stdout_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stub = stub_router(
            &dir,
            "cat > /dev/null\necho 'Aug 02 12:00:00.000 [notice] starting'\necho '16:DEADBEEFCAFEF00D'",
        );
        let hashed = derive_hash(&stub, "secret").await.expect("hash");
        assert_eq!(hashed, "16:DEADBEEFCAFEF00D");
    }

    #[tokio::test]
    async fn failing_subcommand_surfaces_derivation_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stub = stub_router(&dir, "cat > /dev/null\necho 'bad password' >&2\nexit 1");
        let err = derive_hash(&stub, "secret")
            .await
            .expect_err("non-zero exit must fail");
        let text = format!("{}", err);
        assert!(text.contains("bad password"));
    }

    #[tokio::test]
    async fn missing_binary_surfaces_derivation_error() {
        let err = derive_hash(std::path::Path::new("/nonexistent/torflock/tor"), "secret")
            .await
            .expect_err("missing binary must fail");
        assert!(format!("{}", err).contains("failed to spawn"));
    }
}
