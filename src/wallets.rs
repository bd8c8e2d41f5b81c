use alloy::signers::local::PrivateKeySigner;
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use eth_keystore::decrypt_key;
use rpassword::prompt_password;
use std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalletDescriptor {
    pub name: String,
    pub path: PathBuf,
}

impl WalletDescriptor {
    pub fn new(name: impl Into<String>, path: PathBuf) -> Self {
        Self {
            name: name.into(),
            path,
        }
    }
}

/// Encrypted keystores in `dir`, sorted by name. Both `cast wallet import`
/// files (no extension) and `.json` keystores are picked up.
pub fn list_wallets(dir: &Path) -> Result<Vec<WalletDescriptor>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut wallets = Vec::new();
    for entry in fs::read_dir(dir).wrap_err("Failed to read keystore directory")? {
        let entry = entry.wrap_err("Failed to read keystore entry")?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if file_name.starts_with('.') {
            continue;
        }
        let name = file_name.strip_suffix(".json").unwrap_or(file_name).to_owned();
        wallets.push(WalletDescriptor::new(name, path));
    }
    wallets.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(wallets)
}

pub fn find_wallet(dir: &Path, name: &str) -> Result<WalletDescriptor> {
    let wallets = list_wallets(dir)?;
    wallets
        .into_iter()
        .find(|w| w.name == name)
        .ok_or_else(|| eyre!("Wallet '{name}' not found in {}", dir.to_string_lossy()))
}

/// Prompts for the keystore password on the terminal and decrypts it.
pub fn unlock_wallet(descriptor: &WalletDescriptor) -> Result<PrivateKeySigner> {
    let prompt = format!("Enter password for wallet '{}': ", descriptor.name);
    let password = prompt_password(prompt).wrap_err("Failed to read wallet password")?;
    decrypt_wallet(descriptor, &password)
}

pub fn decrypt_wallet(
    descriptor: &WalletDescriptor,
    password: &str,
) -> Result<PrivateKeySigner> {
    let secret = decrypt_key(&descriptor.path, password.as_bytes())
        .map_err(|_| eyre!("Invalid password for wallet '{}'", descriptor.name))?;
    PrivateKeySigner::from_slice(&secret).map_err(|_| {
        eyre!(
            "Wallet '{}' contained unsupported key material",
            descriptor.name
        )
    })
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "team-lottery-wallets-{name}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn list_wallets__missing_directory_is_empty() {
        let dir = std::env::temp_dir().join("team-lottery-wallets-does-not-exist");
        assert!(list_wallets(&dir).unwrap().is_empty());
    }

    #[test]
    fn list_wallets__sorts_and_strips_json_suffix() {
        // given
        let dir = scratch_dir("list");
        fs::write(dir.join("deployer"), "{}").unwrap();
        fs::write(dir.join("alice.json"), "{}").unwrap();
        fs::write(dir.join(".DS_Store"), "").unwrap();
        fs::create_dir_all(dir.join("nested")).unwrap();

        // when
        let names: Vec<String> = list_wallets(&dir)
            .unwrap()
            .into_iter()
            .map(|w| w.name)
            .collect();

        // then
        assert_eq!(names, vec!["alice", "deployer"]);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn find_wallet__reports_unknown_names() {
        let dir = scratch_dir("find");
        fs::write(dir.join("deployer"), "{}").unwrap();

        assert!(find_wallet(&dir, "deployer").is_ok());
        let err = find_wallet(&dir, "bob").unwrap_err();
        assert!(err.to_string().contains("Wallet 'bob' not found"));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn decrypt_wallet__garbage_keystore_is_rejected() {
        let dir = scratch_dir("decrypt");
        let path = dir.join("broken");
        fs::write(&path, "not a keystore").unwrap();

        let result = decrypt_wallet(&WalletDescriptor::new("broken", path), "pw");

        assert!(result.is_err());
        fs::remove_dir_all(&dir).unwrap();
    }
}
