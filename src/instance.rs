//! Named, versioned server instances and their on-disk registry.
//!
//! An instance is a value object over a directory tree: a base directory,
//! config and log directories, an NSS database, and a registry entry under
//! the system configuration root. It owns no process.

use crate::error::{Error, Result};
use crate::external_certs;
use crate::subsystem::Subsystem;
use crate::types::{normalize_token, ExternalCert};
use std::cmp::Ordering;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};

pub const DEFAULT_USER: &str = "pkiuser";
pub const DEFAULT_GROUP: &str = "pkiuser";
pub const DEFAULT_VERSION: u32 = 10;

/// Filesystem roots an instance lives under.
///
/// The defaults match the packaged product layout; tests point all roots
/// at a scratch directory instead.
#[derive(Debug, Clone)]
pub struct Layout {
    /// Instance base directories, one per instance name.
    pub base_root: PathBuf,
    /// Actual location of per-instance config directories.
    pub conf_root: PathBuf,
    /// Actual location of per-instance log directories.
    pub log_root: PathBuf,
    /// Registry root holding per-instance startup settings.
    pub registry_root: PathBuf,
    /// Template service unit the per-instance unit links point at.
    pub unit_template: PathBuf,
    /// Directory of service unit links wanted by the product target.
    pub target_wants: PathBuf,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            base_root: PathBuf::from("/var/lib/pki"),
            conf_root: PathBuf::from("/etc/pki"),
            log_root: PathBuf::from("/var/log/pki"),
            registry_root: PathBuf::from("/etc/sysconfig/pki"),
            unit_template: PathBuf::from("/usr/lib/systemd/system/pki-tomcatd@.service"),
            target_wants: PathBuf::from("/etc/systemd/system/pki-tomcatd.target.wants"),
        }
    }
}

impl Layout {
    /// A layout with every root under `root`. Used by tests and by
    /// installations relocated into a chroot-like prefix.
    pub fn rooted(root: &Path) -> Self {
        Self {
            base_root: root.join("var/lib/pki"),
            conf_root: root.join("etc/pki"),
            log_root: root.join("var/log/pki"),
            registry_root: root.join("etc/sysconfig/pki"),
            unit_template: root.join("usr/lib/systemd/system/pki-tomcatd@.service"),
            target_wants: root.join("etc/systemd/system/pki-tomcatd.target.wants"),
        }
    }
}

/// A named, versioned installation of the server product.
#[derive(Debug, Clone)]
pub struct Instance {
    pub name: String,
    pub version: u32,
    pub user: String,
    pub group: String,
    layout: Layout,
    external_certs: Vec<ExternalCert>,
}

impl Instance {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_layout(name, Layout::default())
    }

    pub fn with_layout(name: impl Into<String>, layout: Layout) -> Self {
        Self {
            name: name.into(),
            version: DEFAULT_VERSION,
            user: DEFAULT_USER.to_string(),
            group: DEFAULT_GROUP.to_string(),
            layout,
            external_certs: Vec::new(),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn base_dir(&self) -> PathBuf {
        self.layout.base_root.join(&self.name)
    }

    pub fn conf_dir(&self) -> PathBuf {
        self.layout.conf_root.join(&self.name)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.layout.log_root.join(&self.name)
    }

    pub fn nssdb_dir(&self) -> PathBuf {
        self.conf_dir().join("alias")
    }

    pub fn password_conf(&self) -> PathBuf {
        self.conf_dir().join("password.conf")
    }

    pub fn server_xml(&self) -> PathBuf {
        self.conf_dir().join("server.xml")
    }

    pub fn banner_file(&self) -> PathBuf {
        self.conf_dir().join("banner.txt")
    }

    pub fn external_certs_conf(&self) -> PathBuf {
        self.conf_dir().join("external_certs.conf")
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.conf_dir().join("certs")
    }

    pub fn cert_file(&self, cert_id: &str) -> PathBuf {
        self.certs_dir().join(format!("{}.crt", cert_id))
    }

    pub fn csr_file(&self, cert_id: &str) -> PathBuf {
        self.certs_dir().join(format!("{}.csr", cert_id))
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.layout.registry_root.join("tomcat").join(&self.name)
    }

    pub fn registry_file(&self) -> PathBuf {
        self.registry_dir().join(&self.name)
    }

    pub fn service_name(&self) -> String {
        format!("pki-tomcatd@{}.service", self.name)
    }

    pub fn unit_file(&self) -> PathBuf {
        self.layout.target_wants.join(self.service_name())
    }

    /// Materialize the on-disk directory tree, registry entry, and service
    /// unit link. Refuses to clobber an existing instance unless `force`.
    pub fn create(&self, force: bool) -> Result<()> {
        if self.base_dir().exists() && !force {
            return Err(Error::AlreadyExists(format!(
                "Instance already exists: {}",
                self.name
            )));
        }

        fs::create_dir_all(self.base_dir())?;
        fs::create_dir_all(self.conf_dir())?;
        fs::create_dir_all(self.certs_dir())?;
        fs::create_dir_all(self.logs_dir())?;

        self.create_registry()?;

        fs::create_dir_all(&self.layout.target_wants)?;
        symlink(&self.layout.unit_template, &self.unit_file())?;

        Ok(())
    }

    fn create_registry(&self) -> Result<()> {
        fs::create_dir_all(self.registry_dir())?;

        log::info!("Creating instance registry: {}", self.registry_file().display());

        let content = format!(
            "PKI_USER={}\nPKI_GROUP={}\nPKI_INSTANCE_NAME={}\nPKI_INSTANCE_PATH={}\n",
            self.user,
            self.group,
            self.name,
            self.base_dir().display()
        );
        fs::write(self.registry_file(), content)?;
        Ok(())
    }

    /// Populate user/group from the registry file and the external-cert
    /// list from its backing file. A missing registry file leaves the
    /// constructor defaults in place.
    pub fn load(&mut self) -> Result<()> {
        let registry_file = self.registry_file();

        if registry_file.exists() {
            log::info!("Loading instance registry: {}", registry_file.display());

            for line in fs::read_to_string(&registry_file)?.lines() {
                if let Some(user) = line.strip_prefix("PKI_USER=") {
                    self.user = user.to_string();
                    log::debug!("- user: {}", self.user);
                }
                if let Some(group) = line.strip_prefix("PKI_GROUP=") {
                    self.group = group.to_string();
                    log::debug!("- group: {}", self.group);
                }
            }
        }

        self.load_external_certs()?;
        Ok(())
    }

    fn load_external_certs(&mut self) -> Result<()> {
        for cert in external_certs::load_external_certs(&self.external_certs_conf())? {
            self.add_external_cert(&cert.nickname, cert.token.as_deref());
        }
        Ok(())
    }

    /// Remove the service unit link, the registry entry, and optionally the
    /// config and log trees. A missing unit link never aborts the remaining
    /// removals; other absences are tolerated only with `force`.
    pub fn remove(&self, remove_conf: bool, remove_logs: bool, force: bool) -> Result<()> {
        let unit_file = self.unit_file();
        log::info!("Removing {}", unit_file.display());
        match fs::remove_file(&unit_file) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::warn!("Link does not exist: {}", unit_file.display());
            }
            Err(e) => return Err(e.into()),
        }

        remove_file(&self.registry_file(), force)?;
        remove_tree(&self.registry_dir(), force)?;
        remove_tree(&self.base_dir(), force)?;

        if remove_conf {
            remove_tree(&self.conf_dir(), force)?;
        }
        if remove_logs {
            remove_tree(&self.logs_dir(), force)?;
        }

        Ok(())
    }

    pub fn external_certs(&self) -> &[ExternalCert] {
        &self.external_certs
    }

    pub fn external_cert_exists(&self, nickname: &str, token: Option<&str>) -> bool {
        let token = normalize_token(token);
        self.external_certs
            .iter()
            .any(|c| c.nickname == nickname && c.token == token)
    }

    /// Add an external cert binding; a duplicate (nickname, token) pair is
    /// silently ignored.
    pub fn add_external_cert(&mut self, nickname: &str, token: Option<&str>) {
        if self.external_cert_exists(nickname, token) {
            return;
        }
        self.external_certs.push(ExternalCert::new(nickname, token));
    }

    pub fn delete_external_cert(&mut self, nickname: &str, token: Option<&str>) {
        let token = normalize_token(token);
        self.external_certs
            .retain(|c| !(c.nickname == nickname && c.token == token));
    }

    /// Persist the external-cert list; an empty list removes the file.
    pub fn store_external_certs(&self) -> Result<()> {
        external_certs::store_external_certs(&self.external_certs_conf(), &self.external_certs)
    }

    /// Password of a security token, read from the instance password file.
    /// The internal token is listed as `internal`, hardware tokens as
    /// `hardware-<name>`.
    pub fn token_password(&self, token: Option<&str>) -> Result<String> {
        let key = match normalize_token(token) {
            None => "internal".to_string(),
            Some(name) => format!("hardware-{}", name),
        };

        for line in fs::read_to_string(self.password_conf())?.lines() {
            if let Some((name, password)) = line.split_once('=') {
                if name == key {
                    return Ok(password.to_string());
                }
            }
        }

        Err(Error::NotFound(format!("No password entry for token: {}", key)))
    }

    pub fn banner_installed(&self) -> bool {
        self.banner_file().exists()
    }

    pub fn banner(&self) -> Result<String> {
        Ok(fs::read_to_string(self.banner_file())?.trim().to_string())
    }

    /// An installed banner must not be empty.
    pub fn validate_banner(&self) -> Result<()> {
        if !self.banner_installed() {
            return Ok(());
        }
        if self.banner()?.is_empty() {
            return Err(Error::Config("Banner is empty".to_string()));
        }
        Ok(())
    }

    /// Subsystems deployed into this instance, identified by a `CS.cfg`
    /// under the instance config directory.
    pub fn subsystems(&self) -> Result<Vec<Subsystem>> {
        let mut subsystems = Vec::new();
        let conf_dir = self.conf_dir();

        if !conf_dir.exists() {
            return Ok(subsystems);
        }

        let mut entries: Vec<_> = fs::read_dir(&conf_dir)?
            .collect::<io::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.path())
            .filter(|p| p.join("CS.cfg").is_file())
            .collect();
        entries.sort();

        for path in entries {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                subsystems.push(Subsystem::new(name, path.clone()));
            }
        }

        Ok(subsystems)
    }

    pub fn subsystem(&self, name: &str) -> Result<Option<Subsystem>> {
        Ok(self
            .subsystems()?
            .into_iter()
            .find(|s| s.name == name))
    }

    /// Registry-listing precedence kept from the previous implementation:
    /// true when either the name or the version sorts lower. This is not a
    /// total order (two instances can both precede each other); use the
    /// `Ord` impl for sorting. Pinned by a test so any fix is deliberate.
    pub fn precedes(&self, other: &Instance) -> bool {
        self.name < other.name || self.version < other.version
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.version == other.version
    }
}

impl Eq for Instance {}

impl Hash for Instance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.version.hash(state);
    }
}

impl PartialOrd for Instance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Instance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then(self.version.cmp(&other.version))
    }
}

impl std::fmt::Display for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Enumerate installed instances from the registry root. A load failure of
/// any single instance aborts the whole enumeration.
pub fn instances(layout: &Layout) -> Result<Vec<Instance>> {
    let mut result = Vec::new();

    if !layout.registry_root.join("tomcat").exists() {
        return Ok(result);
    }

    for entry in fs::read_dir(&layout.base_root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        let mut instance = Instance::with_layout(name, layout.clone());
        instance.load()?;
        result.push(instance);
    }

    Ok(result)
}

fn symlink(target: &Path, link: &Path) -> Result<()> {
    if fs::symlink_metadata(link).is_ok() {
        return Ok(());
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(target, link)?;
    #[cfg(not(unix))]
    let _ = target;
    Ok(())
}

/// Remove a file, tolerating absence only when `force` is set.
pub(crate) fn remove_file(path: &Path, force: bool) -> Result<()> {
    log::info!("Removing {}", path.display());
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if force {
                Ok(())
            } else {
                Err(Error::NotFound(format!("File does not exist: {}", path.display())))
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Remove a directory tree, tolerating absence only when `force` is set.
pub(crate) fn remove_tree(path: &Path, force: bool) -> Result<()> {
    log::info!("Removing {}", path.display());
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if force {
                Ok(())
            } else {
                Err(Error::NotFound(format!(
                    "Directory does not exist: {}",
                    path.display()
                )))
            }
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn scratch_layout() -> (tempfile::TempDir, Layout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::rooted(dir.path());
        (dir, layout)
    }

    #[test]
    fn test_create_load_round_trip() {
        let (_dir, layout) = scratch_layout();

        let mut instance = Instance::with_layout("pki-tomcat", layout.clone());
        instance.user = "pkisrv".to_string();
        instance.create(false).unwrap();

        let mut loaded = Instance::with_layout("pki-tomcat", layout);
        loaded.load().unwrap();

        assert_eq!(loaded.user, "pkisrv");
        assert_eq!(loaded.group, DEFAULT_GROUP);
        assert!(loaded.external_certs().is_empty());
    }

    #[test]
    fn test_create_refuses_to_clobber() {
        let (_dir, layout) = scratch_layout();

        let instance = Instance::with_layout("pki-tomcat", layout);
        instance.create(false).unwrap();

        assert!(matches!(
            instance.create(false),
            Err(Error::AlreadyExists(_))
        ));
        instance.create(true).unwrap();
    }

    #[test]
    fn test_load_registry_last_match_wins() {
        let (_dir, layout) = scratch_layout();

        let mut instance = Instance::with_layout("pki-tomcat", layout);
        instance.create(false).unwrap();
        fs::write(
            instance.registry_file(),
            "PKI_USER=first\nOTHER=ignored\nPKI_USER=second\n",
        )
        .unwrap();

        instance.load().unwrap();
        assert_eq!(instance.user, "second");
    }

    #[test]
    fn test_load_without_registry_keeps_defaults() {
        let (_dir, layout) = scratch_layout();

        let mut instance = Instance::with_layout("pki-tomcat", layout);
        instance.load().unwrap();

        assert_eq!(instance.user, DEFAULT_USER);
        assert_eq!(instance.group, DEFAULT_GROUP);
    }

    #[test]
    fn test_external_cert_duplicates_ignored() {
        let (_dir, layout) = scratch_layout();

        let mut instance = Instance::with_layout("pki-tomcat", layout);
        instance.add_external_cert("n", Some("t"));
        instance.add_external_cert("n", Some("t"));
        instance.add_external_cert("n", None);

        assert_eq!(instance.external_certs().len(), 2);

        instance.delete_external_cert("n", Some("t"));
        assert_eq!(instance.external_certs().len(), 1);
        assert_eq!(instance.external_certs()[0].token, None);
    }

    #[test]
    fn test_remove_tolerates_missing_only_with_force() {
        let (_dir, layout) = scratch_layout();

        let instance = Instance::with_layout("pki-tomcat", layout);
        instance.create(false).unwrap();

        // Missing unit link never aborts the rest of the removal.
        fs::remove_file(instance.unit_file()).unwrap();
        instance.remove(true, true, false).unwrap();
        assert!(!instance.base_dir().exists());
        assert!(!instance.registry_dir().exists());
        assert!(!instance.conf_dir().exists());

        // Gone entirely: only force tolerates it.
        assert!(instance.remove(false, false, false).is_err());
        instance.remove(true, true, true).unwrap();
    }

    #[test]
    fn test_identity_and_total_order() {
        let (_dir, layout) = scratch_layout();

        let mut a = Instance::with_layout("alpha", layout.clone());
        let mut b = Instance::with_layout("alpha", layout.clone());
        b.user = "someone-else".to_string();
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a.clone());
        set.insert(b.clone());
        assert_eq!(set.len(), 1);

        a.version = 9;
        assert_ne!(a, b);

        let c = Instance::with_layout("beta", layout);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_precedes_keeps_or_semantics() {
        let (_dir, layout) = scratch_layout();

        let mut a = Instance::with_layout("alpha", layout.clone());
        a.version = 10;
        let mut b = Instance::with_layout("beta", layout);
        b.version = 9;

        // Name says a before b; version says b before a. Both hold.
        assert!(a.precedes(&b));
        assert!(b.precedes(&a));
    }

    #[test]
    fn test_enumeration_aborts_on_corrupt_instance() {
        let (_dir, layout) = scratch_layout();

        let good = Instance::with_layout("aaa-good", layout.clone());
        good.create(false).unwrap();

        let bad = Instance::with_layout("bbb-bad", layout.clone());
        bad.create(false).unwrap();
        fs::write(bad.external_certs_conf(), "garbage\n").unwrap();

        assert!(matches!(instances(&layout), Err(Error::Format(_))));

        fs::remove_file(bad.external_certs_conf()).unwrap();
        let listed = instances(&layout).unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[test]
    fn test_enumeration_without_registry_root() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::rooted(dir.path());

        assert!(instances(&layout).unwrap().is_empty());
    }

    #[test]
    fn test_token_password_lookup() {
        let (_dir, layout) = scratch_layout();

        let instance = Instance::with_layout("pki-tomcat", layout);
        instance.create(false).unwrap();
        fs::write(
            instance.password_conf(),
            "internal=secret123\nhardware-HSM=hsmpass\n",
        )
        .unwrap();

        assert_eq!(instance.token_password(None).unwrap(), "secret123");
        assert_eq!(instance.token_password(Some("internal")).unwrap(), "secret123");
        assert_eq!(instance.token_password(Some("HSM")).unwrap(), "hsmpass");
        assert!(matches!(
            instance.token_password(Some("missing")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_banner_validation() {
        let (_dir, layout) = scratch_layout();

        let instance = Instance::with_layout("pki-tomcat", layout);
        instance.create(false).unwrap();

        // No banner installed: fine.
        instance.validate_banner().unwrap();

        fs::write(instance.banner_file(), "  \n").unwrap();
        assert!(matches!(
            instance.validate_banner(),
            Err(Error::Config(_))
        ));

        fs::write(instance.banner_file(), "Authorized use only\n").unwrap();
        instance.validate_banner().unwrap();
        assert_eq!(instance.banner().unwrap(), "Authorized use only");
    }
}
