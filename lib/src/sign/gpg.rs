//! The GPG backend : verification is delegated to `gpgv`
//! rather than linked against GPGME, so this module's job is staging the
//! keyring/data/signature as files and parsing `--status-fd` output.

use crate::error::CoreError;
use crate::task::Task;
use cap_std_ext::cap_std;
use cap_std_ext::cap_tempfile;
use cap_std_ext::dirext::CapStdExtDirExt;

/// The subset of GNUPG status-fd lines this backend cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct GpgAttributes {
    good: bool,
    expired: bool,
    revoked: bool,
    missing_key: bool,
}

impl GpgAttributes {
    fn parse(status: &str) -> Self {
        let mut attrs = Self::default();
        for line in status.lines() {
            let Some(rest) = line.strip_prefix("[GNUPG:] ") else { continue };
            let keyword = rest.split_whitespace().next().unwrap_or("");
            match keyword {
                "GOODSIG" | "VALIDSIG" => attrs.good = true,
                "EXPSIG" | "EXPKEYSIG" => attrs.expired = true,
                "REVKEYSIG" => attrs.revoked = true,
                "ERRSIG" | "NO_PUBKEY" => attrs.missing_key = true,
                _ => {}
            }
        }
        attrs
    }

    fn is_valid(&self) -> bool {
        self.good && !self.expired && !self.revoked && !self.missing_key
    }
}

/// Verify `sig` over `data` against an exported GPG public key (binary or
/// ASCII-armored), by staging both and the keyring in a scratch directory
/// and invoking `gpgv` with a status-fd we can parse.
pub fn verify(data: &[u8], sig: &[u8], keyring: &[u8]) -> Result<bool, CoreError> {
    run_gpgv(data, sig, keyring).map_err(|e| CoreError::invalid_format(format!("gpg verification failed: {e}")))
}

fn run_gpgv(data: &[u8], sig: &[u8], keyring: &[u8]) -> anyhow::Result<bool> {
    let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
    td.write("data", data)?;
    td.write("data.sig", sig)?;
    td.write("keyring.gpg", keyring)?;

    let status = Task::new("verifying gpg signature", "gpgv")
        .root(&td)?
        .quiet()
        .args([
            "--status-fd=1",
            "--keyring",
            "keyring.gpg",
            "data.sig",
            "data",
        ])
        .read()
        .unwrap_or_default();

    Ok(GpgAttributes::parse(&status).is_valid())
}
