//! Cross-process resource manager for profiles.
//!
//! Profiles are owned here, in an arena keyed by `ProfileId`. A profile with a
//! data directory is shared by every reference naming that directory for the
//! lifetime of the manager. An incognito profile (empty data directory) is
//! never shared.
//!
//! References are counted for diagnostics only. Releasing the last reference
//! does not destroy a profile; only `destroy` and `destroy_all` do.

use super::config::{ProxyConfig, SpellCheckConfig};
use crate::{LinkError, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

/// Arena index of a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProfileId(pub u64);

impl std::fmt::Display for ProfileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "profile-{}", self.0)
    }
}

/// Flags fixed when a profile is first created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProfileFlags {
    pub disk_cache_enabled: bool,
    pub cookie_persistence_enabled: bool,
}

/// Which proxy settings a profile uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxySetting {
    /// Follow the operating system's proxy configuration.
    System,
    Custom(ProxyConfig),
}

/// One shared profile.
#[derive(Debug)]
pub struct Profile {
    id: ProfileId,
    data_dir: PathBuf,
    // Keeps an incognito profile's private directory alive.
    temp_dir: Option<TempDir>,
    flags: ProfileFlags,
    proxy: ProxySetting,
    spellcheck: SpellCheckConfig,
    custom_words: BTreeSet<String>,
    autocorrect: BTreeMap<String, String>,
    refs: usize,
}

impl Profile {
    pub fn id(&self) -> ProfileId {
        self.id
    }

    /// Directory holding the profile's on-disk state. For an incognito
    /// profile this is a private temporary directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn is_incognito(&self) -> bool {
        self.temp_dir.is_some()
    }

    pub fn flags(&self) -> ProfileFlags {
        self.flags
    }

    pub fn proxy(&self) -> &ProxySetting {
        &self.proxy
    }

    pub fn set_proxy_config(&mut self, config: ProxyConfig) {
        debug!("{}: proxy configuration set", self.id);
        self.proxy = ProxySetting::Custom(config);
    }

    pub fn use_system_proxy_config(&mut self) {
        debug!("{}: using system proxy configuration", self.id);
        self.proxy = ProxySetting::System;
    }

    pub fn spellcheck(&self) -> &SpellCheckConfig {
        &self.spellcheck
    }

    pub fn set_spellcheck_config(&mut self, config: SpellCheckConfig) {
        self.spellcheck = config;
    }

    pub fn custom_words(&self) -> &BTreeSet<String> {
        &self.custom_words
    }

    pub fn add_custom_words(&mut self, words: impl IntoIterator<Item = String>) {
        self.custom_words.extend(words);
    }

    pub fn remove_custom_words<'a>(&mut self, words: impl IntoIterator<Item = &'a String>) {
        for word in words {
            self.custom_words.remove(word);
        }
    }

    /// Autocorrect replacements, keyed by the misspelling.
    pub fn autocorrect(&self) -> &BTreeMap<String, String> {
        &self.autocorrect
    }

    pub fn add_autocorrect_words(&mut self, pairs: impl IntoIterator<Item = (String, String)>) {
        self.autocorrect.extend(pairs);
    }

    pub fn remove_autocorrect_words<'a>(&mut self, bad_words: impl IntoIterator<Item = &'a String>) {
        for word in bad_words {
            self.autocorrect.remove(word);
        }
    }

    /// Number of live references from client-side objects.
    pub fn ref_count(&self) -> usize {
        self.refs
    }
}

/// Owner of every profile of a host process.
#[derive(Debug, Default)]
pub struct ProfileManager {
    profiles: HashMap<ProfileId, Profile>,
    by_data_dir: HashMap<PathBuf, ProfileId>,
    next_id: u64,
    destroyed_all: bool,
}

impl ProfileManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference to the profile for `data_dir`, creating it if needed.
    ///
    /// An empty `data_dir` always creates a fresh incognito profile. For an
    /// existing profile the flags must match those it was created with; a
    /// mismatch is a caller bug, fatal in debug builds, and otherwise the
    /// existing flags win.
    pub fn obtain(&mut self, data_dir: &str, flags: ProfileFlags) -> Result<ProfileId> {
        if self.destroyed_all {
            return Err(LinkError::ProfilesDestroyed);
        }

        if data_dir.is_empty() {
            return self.create_incognito(flags);
        }

        let key = PathBuf::from(data_dir);
        if let Some(&id) = self.by_data_dir.get(&key) {
            let profile = self
                .profiles
                .get_mut(&id)
                .ok_or(LinkError::ProfileNotFound(id.0))?;
            if profile.flags != flags {
                error!(
                    "Profile {} requested with flags {:?} but was created with {:?}",
                    data_dir, flags, profile.flags
                );
                debug_assert!(
                    profile.flags == flags,
                    "conflicting flags for profile {}",
                    data_dir
                );
            }
            profile.refs += 1;
            debug!("{} for {} now has {} references", id, data_dir, profile.refs);
            return Ok(id);
        }

        std::fs::create_dir_all(&key).map_err(|e| {
            LinkError::io_with_context(e, format!("Failed to create profile directory {}", data_dir))
        })?;

        let id = self.insert(key.clone(), None, flags);
        self.by_data_dir.insert(key, id);
        info!("Created {} at {}", id, data_dir);
        Ok(id)
    }

    fn create_incognito(&mut self, mut flags: ProfileFlags) -> Result<ProfileId> {
        if flags != ProfileFlags::default() {
            warn!("Incognito profiles never persist state, ignoring {:?}", flags);
            flags = ProfileFlags::default();
        }

        let temp_dir = tempfile::Builder::new()
            .prefix("hostlink_")
            .tempdir()
            .map_err(|e| LinkError::io_with_context(e, "Failed to create incognito directory"))?;
        let path = temp_dir.path().to_path_buf();

        let id = self.insert(path, Some(temp_dir), flags);
        info!("Created incognito {}", id);
        Ok(id)
    }

    fn insert(&mut self, data_dir: PathBuf, temp_dir: Option<TempDir>, flags: ProfileFlags) -> ProfileId {
        let id = ProfileId(self.next_id);
        self.next_id += 1;
        self.profiles.insert(
            id,
            Profile {
                id,
                data_dir,
                temp_dir,
                flags,
                proxy: ProxySetting::System,
                spellcheck: SpellCheckConfig::default(),
                custom_words: BTreeSet::new(),
                autocorrect: BTreeMap::new(),
                refs: 1,
            },
        );
        id
    }

    /// Drop one reference. The profile stays alive.
    pub fn release(&mut self, id: ProfileId) -> Result<()> {
        let profile = self
            .profiles
            .get_mut(&id)
            .ok_or(LinkError::ProfileNotFound(id.0))?;
        profile.refs = profile.refs.saturating_sub(1);
        debug!("{} released, {} references left", id, profile.refs);
        Ok(())
    }

    /// Destroy a profile. This is the application-level teardown of its
    /// identity; later `obtain` calls for the same directory create a new one.
    pub fn destroy(&mut self, id: ProfileId) -> Result<()> {
        let profile = self
            .profiles
            .remove(&id)
            .ok_or(LinkError::ProfileNotFound(id.0))?;
        if profile.refs > 0 {
            warn!("Destroying {} with {} live references", id, profile.refs);
        }
        if !profile.is_incognito() {
            self.by_data_dir.remove(&profile.data_dir);
        }
        info!("Destroyed {}", id);
        Ok(())
    }

    /// Destroy every profile. Called once at shutdown, after the control loop
    /// has stopped; `obtain` fails afterwards.
    pub fn destroy_all(&mut self) {
        if self.destroyed_all {
            return;
        }
        self.destroyed_all = true;
        let count = self.profiles.len();
        self.by_data_dir.clear();
        self.profiles.clear();
        info!("Destroyed all {} profiles", count);
    }

    pub fn get(&self, id: ProfileId) -> Option<&Profile> {
        self.profiles.get(&id)
    }

    pub fn get_mut(&mut self, id: ProfileId) -> Option<&mut Profile> {
        self.profiles.get_mut(&id)
    }

    /// Profile currently owning `data_dir`, if any.
    pub fn find_by_data_dir(&self, data_dir: &str) -> Option<ProfileId> {
        self.by_data_dir.get(Path::new(data_dir)).copied()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FLAGS_A: ProfileFlags = ProfileFlags {
        disk_cache_enabled: true,
        cookie_persistence_enabled: false,
    };

    fn data_dir(root: &TempDir) -> String {
        root.path().join("data").to_string_lossy().into_owned()
    }

    #[test]
    fn test_same_identity_is_shared() {
        let root = TempDir::new().unwrap();
        let dir = data_dir(&root);
        let mut manager = ProfileManager::new();

        let first = manager.obtain(&dir, FLAGS_A).unwrap();
        let second = manager.obtain(&dir, FLAGS_A).unwrap();

        assert_eq!(first, second);
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.get(first).unwrap().ref_count(), 2);
        assert!(Path::new(&dir).is_dir());
    }

    #[test]
    fn test_incognito_is_never_shared() {
        let mut manager = ProfileManager::new();

        let first = manager.obtain("", ProfileFlags::default()).unwrap();
        let second = manager.obtain("", ProfileFlags::default()).unwrap();

        assert_ne!(first, second);
        assert_eq!(manager.len(), 2);
        let profile = manager.get(first).unwrap();
        assert!(profile.is_incognito());
        assert!(profile.data_dir().is_dir());
    }

    #[test]
    fn test_incognito_forces_flags_off() {
        let mut manager = ProfileManager::new();
        let id = manager.obtain("", FLAGS_A).unwrap();
        assert_eq!(manager.get(id).unwrap().flags(), ProfileFlags::default());
    }

    #[test]
    fn test_destroy_incognito_removes_directory() {
        let mut manager = ProfileManager::new();
        let id = manager.obtain("", ProfileFlags::default()).unwrap();
        let path = manager.get(id).unwrap().data_dir().to_path_buf();

        manager.release(id).unwrap();
        manager.destroy(id).unwrap();
        assert!(!path.exists());
        assert!(manager.get(id).is_none());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "conflicting flags")]
    fn test_conflicting_flags_assert_in_debug() {
        let root = TempDir::new().unwrap();
        let dir = data_dir(&root);
        let mut manager = ProfileManager::new();

        manager.obtain(&dir, FLAGS_A).unwrap();
        let _ = manager.obtain(&dir, ProfileFlags::default());
    }

    #[test]
    fn test_release_never_destroys() {
        let root = TempDir::new().unwrap();
        let dir = data_dir(&root);
        let mut manager = ProfileManager::new();

        let id = manager.obtain(&dir, FLAGS_A).unwrap();
        manager.release(id).unwrap();
        manager.release(id).unwrap();

        let profile = manager.get(id).unwrap();
        assert_eq!(profile.ref_count(), 0);
        assert_eq!(manager.obtain(&dir, FLAGS_A).unwrap(), id);
    }

    #[test]
    fn test_destroy_frees_identity() {
        let root = TempDir::new().unwrap();
        let dir = data_dir(&root);
        let mut manager = ProfileManager::new();

        let id = manager.obtain(&dir, FLAGS_A).unwrap();
        manager.destroy(id).unwrap();
        assert_eq!(manager.find_by_data_dir(&dir), None);

        let recreated = manager.obtain(&dir, FLAGS_A).unwrap();
        assert_ne!(recreated, id);
        assert!(matches!(
            manager.destroy(id),
            Err(LinkError::ProfileNotFound(_))
        ));
    }

    #[test]
    fn test_destroy_all_is_final() {
        let root = TempDir::new().unwrap();
        let mut manager = ProfileManager::new();
        manager.obtain(&data_dir(&root), FLAGS_A).unwrap();
        manager.obtain("", ProfileFlags::default()).unwrap();

        manager.destroy_all();
        assert!(manager.is_empty());
        assert!(matches!(
            manager.obtain("", ProfileFlags::default()),
            Err(LinkError::ProfilesDestroyed)
        ));
        manager.destroy_all();
    }

    #[test]
    fn test_profile_state_updates() {
        let mut manager = ProfileManager::new();
        let id = manager.obtain("", ProfileFlags::default()).unwrap();
        let profile = manager.get_mut(id).unwrap();

        assert_eq!(profile.proxy(), &ProxySetting::System);
        profile.set_proxy_config(ProxyConfig::default());
        assert_eq!(profile.proxy(), &ProxySetting::Custom(ProxyConfig::default()));

        profile.add_custom_words(["foo".to_string(), "bar".to_string()]);
        profile.remove_custom_words(&["foo".to_string()]);
        assert_eq!(
            profile.custom_words().iter().collect::<Vec<_>>(),
            vec!["bar"]
        );

        profile.add_autocorrect_words([("teh".to_string(), "the".to_string())]);
        assert_eq!(profile.autocorrect().get("teh").map(String::as_str), Some("the"));
        profile.remove_autocorrect_words(&["teh".to_string()]);
        assert!(profile.autocorrect().is_empty());
    }
}
