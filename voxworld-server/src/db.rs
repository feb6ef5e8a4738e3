//! The player document store and license records.
//!
//! The core only ever talks to the store through the [`PlayerStore`] trait:
//! one player document per uid, one territory document per uid, one score
//! document per uid, and one license record per account email. The bundled
//! [`FileStore`] keeps each document as a JSON file, standing in for the
//! external document database.

use std::fs;
use std::path::PathBuf;

use glam::IVec3;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use voxworld::entity::PlayerRecord;
use voxworld::score::ScoreDoc;

/// The account record behind a login email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct License {
    pub mail: String,
    /// Hex encoded salted hash; the clear password never exists server side.
    pub password_hash: String,
    /// The license key, also the client side half of the password cipher.
    pub license_key: String,
    /// The player this account controls.
    pub uid: u32,
    /// Avatar name, denormalized from the player document.
    pub avatar: String,
    /// Date of the last login, informational only.
    #[serde(default)]
    pub last_seen: String,
}

impl License {

    /// Hash a password with the configured salt.
    pub fn hash_password(password: &[u8], salt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(password);
        hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Compare a decrypted password against the stored hash. The same salt
    /// must be used by the account creation frontend.
    pub fn verify_password(&self, password: &[u8], salt: &str) -> bool {
        Self::hash_password(password, salt) == self.password_hash
    }

}

/// The persistence interface of the world server. Everything here may block
/// on I/O and must never be called under a geometry lock.
pub trait PlayerStore: Send + Sync {

    fn load_license(&self, mail: &str) -> Option<License>;
    fn save_license(&self, license: &License);

    fn load_player(&self, uid: u32) -> Option<PlayerRecord>;
    fn save_player(&self, uid: u32, record: &PlayerRecord);

    fn load_territory(&self, uid: u32) -> Vec<IVec3>;
    fn save_territory(&self, uid: u32, territory: &[IVec3]);

    fn load_score(&self, uid: u32) -> Option<ScoreDoc>;
    fn save_score(&self, uid: u32, doc: &ScoreDoc);

}

/// JSON-file-per-document store.
pub struct FileStore {
    folder: PathBuf,
}

impl FileStore {

    pub fn new(folder: impl Into<PathBuf>) -> std::io::Result<Self> {
        let folder = folder.into();
        fs::create_dir_all(&folder)?;
        Ok(Self { folder })
    }

    fn file(&self, prefix: &str, key: &str) -> PathBuf {
        // Emails can contain characters that do not belong in file names.
        let safe: String = key.chars()
            .map(|c| if c.is_ascii_alphanumeric() || "@._-".contains(c) { c } else { '_' })
            .collect();
        self.folder.join(format!("{prefix}-{safe}.json"))
    }

    fn load_doc<T: for<'de> Deserialize<'de>>(&self, prefix: &str, key: &str) -> Option<T> {
        let path = self.file(prefix, key);
        let text = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&text) {
            Ok(doc) => Some(doc),
            Err(e) => {
                warn!("bad document {}: {e}", path.display());
                None
            }
        }
    }

    fn save_doc<T: Serialize>(&self, prefix: &str, key: &str, doc: &T) {
        let path = self.file(prefix, key);
        let text = match serde_json::to_string_pretty(doc) {
            Ok(text) => text,
            Err(e) => {
                warn!("serializing {}: {e}", path.display());
                return;
            }
        };
        if let Err(e) = fs::write(&path, text) {
            // Logged only; the next autosave retries.
            warn!("writing {}: {e}", path.display());
        }
    }

}

impl PlayerStore for FileStore {

    fn load_license(&self, mail: &str) -> Option<License> {
        self.load_doc("license", mail)
    }

    fn save_license(&self, license: &License) {
        self.save_doc("license", &license.mail, license);
    }

    fn load_player(&self, uid: u32) -> Option<PlayerRecord> {
        self.load_doc("player", &uid.to_string())
    }

    fn save_player(&self, uid: u32, record: &PlayerRecord) {
        self.save_doc("player", &uid.to_string(), record);
    }

    fn load_territory(&self, uid: u32) -> Vec<IVec3> {
        self.load_doc::<Vec<[i32; 3]>>("territory", &uid.to_string())
            .unwrap_or_default()
            .into_iter()
            .map(IVec3::from_array)
            .collect()
    }

    fn save_territory(&self, uid: u32, territory: &[IVec3]) {
        let doc: Vec<[i32; 3]> = territory.iter().map(|cc| cc.to_array()).collect();
        self.save_doc("territory", &uid.to_string(), &doc);
    }

    fn load_score(&self, uid: u32) -> Option<ScoreDoc> {
        self.load_doc("score", &uid.to_string())
    }

    fn save_score(&self, uid: u32, doc: &ScoreDoc) {
        self.save_doc("score", &uid.to_string(), doc);
    }

}

#[cfg(test)]
mod tests {

    use super::*;

    fn test_store(name: &str) -> FileStore {
        let dir = std::env::temp_dir().join(format!("voxworld-db-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        FileStore::new(dir).unwrap()
    }

    #[test]
    fn password_hashing_uses_the_salt() {
        let license = License {
            mail: "a@b".into(),
            password_hash: License::hash_password(b"hunter2", "pepper"),
            license_key: "KEY".into(),
            uid: 1,
            avatar: "ada".into(),
            last_seen: String::new(),
        };
        assert!(license.verify_password(b"hunter2", "pepper"));
        assert!(!license.verify_password(b"hunter2", "salt"));
        assert!(!license.verify_password(b"hunter3", "pepper"));
    }

    #[test]
    fn documents_round_trip() {
        let store = test_store("roundtrip");

        let record = PlayerRecord { name: "ada".into(), level: 4, ..Default::default() };
        store.save_player(17, &record);
        assert_eq!(store.load_player(17).unwrap().level, 4);
        assert!(store.load_player(18).is_none());

        let territory = vec![IVec3::new(0, 0, 0), IVec3::new(1, 0, 0)];
        store.save_territory(17, &territory);
        assert_eq!(store.load_territory(17), territory);
        assert!(store.load_territory(18).is_empty());

        store.save_score(17, &ScoreDoc { score: 5.0, balance: 12.0, timestamp: 99 });
        assert_eq!(store.load_score(17).unwrap().timestamp, 99);
    }

    #[test]
    fn licenses_are_keyed_by_mail() {
        let store = test_store("license");
        let license = License {
            mail: "someone@example.com".into(),
            password_hash: String::new(),
            license_key: "ABCDEFGHIJKLMNOPQRST".into(),
            uid: 3,
            avatar: "kim".into(),
            last_seen: String::new(),
        };
        store.save_license(&license);
        let back = store.load_license("someone@example.com").unwrap();
        assert_eq!(back.uid, 3);
        assert!(store.load_license("else@example.com").is_none());
    }

}
