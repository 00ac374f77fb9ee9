//! Private account database of the sandbox
//!
//! The three colon-delimited tables (`etc/passwd`, `etc/group`, `etc/shadow`)
//! are parsed once into [`Tables`], mutated in memory and written back through
//! temp files renamed in a fixed order: shadow, group, then passwd. passwd is
//! the commit record, so a crash between renames can only leave shadow or
//! group rows without an account, which [`Tables::load`] tolerates.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::unistd::{Gid, Uid, chown, geteuid};

use crate::crypt;
use crate::environment::ChrootEnvironment;
use crate::error::{Error, IoContext, Result};
use crate::utils::{commit_staged, ensure_dir, stage_file, write_atomic};

/// First uid handed out to sandbox accounts
pub const FIRST_UID: u32 = 1000;
const LAST_UID: u32 = 59999;
const DEFAULT_SHELL: &str = "/bin/bash";

const PASSWD: &str = "/etc/passwd";
const GROUP: &str = "/etc/group";
const SHADOW: &str = "/etc/shadow";

const PROFILE: &str = r#"# ~/.profile: executed by login shells inside the sandbox
export PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin
umask 022

if [ -n "$BASH_VERSION" ] && [ -f "$HOME/.bashrc" ]; then
    . "$HOME/.bashrc"
fi
"#;

const BASHRC: &str = r#"# ~/.bashrc: interactive shell settings inside the sandbox
case $- in
    *i*) ;;
    *) return ;;
esac

PS1='\u@secure-chroot:\w\$ '
HISTCONTROL=ignoreboth
alias ll='ls -l'
alias la='ls -A'
"#;

/// One account as seen by the rest of the crate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub comment: String,
    /// Home directory as seen from inside the sandbox
    pub home: PathBuf,
    pub shell: PathBuf,
    pub password_hash: String,
}

impl UserRecord {
    /// Sandbox accounts, as opposed to the built-in root account.
    pub fn is_sandbox_account(&self) -> bool {
        self.uid >= FIRST_UID
    }
}

/// Everything needed to put an account back after a rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountExport {
    pub record: UserRecord,
    pub group_name: String,
    pub aging: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PasswdEntry {
    name: String,
    placeholder: String,
    uid: u32,
    gid: u32,
    comment: String,
    home: String,
    shell: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct GroupEntry {
    name: String,
    placeholder: String,
    gid: u32,
    members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ShadowEntry {
    name: String,
    hash: String,
    /// lastchg, min, max, warn, inactive, expire, reserved
    aging: Vec<String>,
}

/// In-memory form of the three tables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Tables {
    passwd: Vec<PasswdEntry>,
    group: Vec<GroupEntry>,
    shadow: Vec<ShadowEntry>,
}

impl Tables {
    fn baseline() -> Self {
        Tables {
            passwd: vec![PasswdEntry {
                name: "root".to_string(),
                placeholder: "x".to_string(),
                uid: 0,
                gid: 0,
                comment: "root".to_string(),
                home: "/root".to_string(),
                shell: DEFAULT_SHELL.to_string(),
            }],
            group: vec![GroupEntry {
                name: "root".to_string(),
                placeholder: "x".to_string(),
                gid: 0,
                members: Vec::new(),
            }],
            shadow: vec![ShadowEntry {
                name: "root".to_string(),
                hash: "*".to_string(),
                aging: default_aging(),
            }],
        }
    }

    fn load(env: &ChrootEnvironment) -> Result<Self> {
        let read = |path: &str| {
            let host = env.inside(path);
            fs::read_to_string(&host).io_context(|| format!("reading {}", host.display()))
        };

        let tables = Tables {
            passwd: parse_passwd(&read(PASSWD)?)?,
            group: parse_group(&read(GROUP)?)?,
            shadow: parse_shadow(&read(SHADOW)?)?,
        };
        tables.check_consistency()?;
        Ok(tables)
    }

    fn check_consistency(&self) -> Result<()> {
        let mut uids = HashSet::new();
        for (idx, entry) in self.passwd.iter().enumerate() {
            if !uids.insert(entry.uid) {
                return Err(Error::corrupt(
                    "passwd",
                    idx + 1,
                    format!("uid {} is used twice", entry.uid),
                ));
            }
            if !self.shadow.iter().any(|s| s.name == entry.name) {
                return Err(Error::corrupt(
                    "shadow",
                    0,
                    format!("no entry for account '{}'", entry.name),
                ));
            }
        }

        for orphan in self
            .shadow
            .iter()
            .filter(|s| !self.passwd.iter().any(|p| p.name == s.name))
        {
            log::warn!(
                "shadow entry '{}' has no matching account; ignoring it",
                orphan.name
            );
        }

        Ok(())
    }

    fn save(&self, env: &ChrootEnvironment) -> Result<()> {
        let staged = [
            stage_file(&env.inside(SHADOW), render_shadow(&self.shadow).as_bytes(), 0o600)?,
            stage_file(&env.inside(GROUP), render_group(&self.group).as_bytes(), 0o644)?,
            stage_file(&env.inside(PASSWD), render_passwd(&self.passwd).as_bytes(), 0o644)?,
        ];
        for file in staged {
            log::debug!("Committing {}", file.target().display());
            commit_staged(file)?;
        }
        Ok(())
    }

    fn record(&self, entry: &PasswdEntry) -> UserRecord {
        let hash = self
            .shadow
            .iter()
            .find(|s| s.name == entry.name)
            .map(|s| s.hash.clone())
            .unwrap_or_default();
        UserRecord {
            username: entry.name.clone(),
            uid: entry.uid,
            gid: entry.gid,
            comment: entry.comment.clone(),
            home: PathBuf::from(&entry.home),
            shell: PathBuf::from(&entry.shell),
            password_hash: hash,
        }
    }

    fn next_free_id(&self) -> Option<u32> {
        let used: HashSet<u32> = self
            .passwd
            .iter()
            .flat_map(|p| [p.uid, p.gid])
            .chain(self.group.iter().map(|g| g.gid))
            .collect();
        (FIRST_UID..=LAST_UID).find(|id| !used.contains(id))
    }

    /// Drop half-written rows a crashed create left behind for `name`.
    fn drop_orphans(&mut self, name: &str) {
        let before = self.shadow.len() + self.group.len();
        self.shadow.retain(|s| s.name != name);
        self.group.retain(|g| g.name != name || !g.members.is_empty());
        if self.shadow.len() + self.group.len() != before {
            log::warn!("Removed stale rows for '{}' left by an interrupted create", name);
        }
    }
}

/// Reads and writes the account tables of one environment.
pub struct UserRegistry<'a> {
    env: &'a ChrootEnvironment,
}

impl<'a> UserRegistry<'a> {
    pub fn new(env: &'a ChrootEnvironment) -> Self {
        Self { env }
    }

    pub fn list_accounts(&self) -> Result<Vec<UserRecord>> {
        let tables = Tables::load(self.env)?;
        Ok(tables.passwd.iter().map(|p| tables.record(p)).collect())
    }

    pub fn find(&self, username: &str) -> Result<UserRecord> {
        self.list_accounts()?
            .into_iter()
            .find(|r| r.username == username)
            .ok_or_else(|| Error::AccountNotFound(username.to_string()))
    }

    pub fn create_account(&self, username: &str, password: &str) -> Result<UserRecord> {
        validate_username(username)?;
        let mut tables = Tables::load(self.env)?;

        if tables.passwd.iter().any(|p| p.name == username) {
            return Err(Error::DuplicateAccount(username.to_string()));
        }
        tables.drop_orphans(username);

        let id = tables.next_free_id().ok_or_else(|| {
            Error::precondition(format!("no free uid in {}..={}", FIRST_UID, LAST_UID))
        })?;

        let entry = PasswdEntry {
            name: username.to_string(),
            placeholder: "x".to_string(),
            uid: id,
            gid: id,
            comment: username.to_string(),
            home: format!("/home/{}", username),
            shell: DEFAULT_SHELL.to_string(),
        };
        tables.group.push(GroupEntry {
            name: username.to_string(),
            placeholder: "x".to_string(),
            gid: id,
            members: Vec::new(),
        });
        tables.shadow.push(ShadowEntry {
            name: username.to_string(),
            hash: crypt::hash_password(password)?,
            aging: default_aging(),
        });

        self.prepare_home(username, id, id)?;
        tables.passwd.push(entry.clone());
        tables.save(self.env)?;

        log::info!("Created account {} (uid {})", username, id);
        Ok(tables.record(&entry))
    }

    pub fn set_password(&self, username: &str, password: &str) -> Result<()> {
        let mut tables = Tables::load(self.env)?;
        if !tables.passwd.iter().any(|p| p.name == username) {
            return Err(Error::AccountNotFound(username.to_string()));
        }
        if let Some(shadow) = tables.shadow.iter_mut().find(|s| s.name == username) {
            shadow.hash = crypt::hash_password(password)?;
            shadow.aging[0] = days_since_epoch().to_string();
        }
        tables.save(self.env)?;
        log::info!("Password reset for {}", username);
        Ok(())
    }

    /// Overwrite all three tables with only a locked root entry.
    pub fn reset_to_baseline(&self) -> Result<()> {
        ensure_dir(self.env.inside("/etc"), 0o755)?;
        Tables::baseline().save(self.env)?;
        log::info!("Credential tables reset to baseline");
        Ok(())
    }

    pub fn export_accounts(&self) -> Result<Vec<AccountExport>> {
        let tables = Tables::load(self.env)?;
        Ok(tables
            .passwd
            .iter()
            .filter(|p| p.uid >= FIRST_UID)
            .map(|p| {
                let group_name = tables
                    .group
                    .iter()
                    .find(|g| g.gid == p.gid)
                    .map(|g| g.name.clone())
                    .unwrap_or_else(|| p.name.clone());
                let aging = tables
                    .shadow
                    .iter()
                    .find(|s| s.name == p.name)
                    .map(|s| s.aging.clone())
                    .unwrap_or_else(default_aging);
                AccountExport {
                    record: tables.record(p),
                    group_name,
                    aging,
                }
            })
            .collect())
    }

    /// Re-apply an exported account with its original ids and hash.
    pub fn import_account(&self, export: &AccountExport) -> Result<UserRecord> {
        let record = &export.record;
        validate_username(&record.username)?;
        let mut tables = Tables::load(self.env)?;

        if tables.passwd.iter().any(|p| p.name == record.username) {
            return Err(Error::DuplicateAccount(record.username.clone()));
        }
        if tables.passwd.iter().any(|p| p.uid == record.uid) {
            return Err(Error::precondition(format!(
                "uid {} of '{}' is already taken",
                record.uid, record.username
            )));
        }
        tables.drop_orphans(&record.username);

        let entry = PasswdEntry {
            name: record.username.clone(),
            placeholder: "x".to_string(),
            uid: record.uid,
            gid: record.gid,
            comment: record.comment.clone(),
            home: record.home.to_string_lossy().into_owned(),
            shell: record.shell.to_string_lossy().into_owned(),
        };
        if !tables.group.iter().any(|g| g.gid == record.gid) {
            tables.group.push(GroupEntry {
                name: export.group_name.clone(),
                placeholder: "x".to_string(),
                gid: record.gid,
                members: Vec::new(),
            });
        }
        let mut aging = export.aging.clone();
        aging.resize(7, String::new());
        tables.shadow.push(ShadowEntry {
            name: record.username.clone(),
            hash: record.password_hash.clone(),
            aging,
        });

        self.prepare_home(&record.username, record.uid, record.gid)?;
        tables.passwd.push(entry.clone());
        tables.save(self.env)?;

        log::info!("Restored account {} (uid {})", record.username, record.uid);
        Ok(tables.record(&entry))
    }

    /// Create the home directory with mode 0700 and seed the shell profile.
    pub fn prepare_home(&self, username: &str, uid: u32, gid: u32) -> Result<()> {
        let home = self.env.home_of(username);
        ensure_dir(self.env.root().join("home"), 0o755)?;
        ensure_dir(&home, 0o700)?;

        for (name, contents) in [(".profile", PROFILE), (".bashrc", BASHRC)] {
            let path = home.join(name);
            if !path.exists() {
                write_atomic(&path, contents.as_bytes(), 0o644)?;
            }
        }

        set_owner(&home, uid, gid)?;
        for entry in fs::read_dir(&home).io_context(|| format!("listing {}", home.display()))? {
            let entry = entry.io_context(|| format!("listing {}", home.display()))?;
            set_owner(&entry.path(), uid, gid)?;
        }
        Ok(())
    }
}

fn set_owner(path: &Path, uid: u32, gid: u32) -> Result<()> {
    if !geteuid().is_root() {
        log::debug!("Not root; leaving ownership of {} unchanged", path.display());
        return Ok(());
    }
    chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
        .io_context(|| format!("chown {}:{} {}", uid, gid, path.display()))
}

/// Usernames follow the portable `[a-z_][a-z0-9_-]{0,31}` rule.
pub fn validate_username(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_first = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if valid_first && valid_rest && name.len() <= 32 {
        Ok(())
    } else {
        Err(Error::InvalidAccountName(name.to_string()))
    }
}

fn days_since_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() / 86_400)
        .unwrap_or(0)
}

fn default_aging() -> Vec<String> {
    vec![
        days_since_epoch().to_string(),
        "0".to_string(),
        "99999".to_string(),
        "7".to_string(),
        String::new(),
        String::new(),
        String::new(),
    ]
}

fn rows(content: &str) -> impl Iterator<Item = (usize, Vec<&str>)> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| (idx + 1, line.split(':').collect()))
}

fn parse_id(table: &'static str, line: usize, field: &str, what: &str) -> Result<u32> {
    field
        .parse()
        .map_err(|_| Error::corrupt(table, line, format!("{} '{}' is not numeric", what, field)))
}

fn check_name(table: &'static str, line: usize, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::corrupt(table, line, "empty name"));
    }
    Ok(())
}

fn parse_passwd(content: &str) -> Result<Vec<PasswdEntry>> {
    let mut entries: Vec<PasswdEntry> = Vec::new();
    for (line, fields) in rows(content) {
        let [name, placeholder, uid, gid, comment, home, shell] = fields[..] else {
            return Err(Error::corrupt(
                "passwd",
                line,
                format!("expected 7 fields, found {}", fields.len()),
            ));
        };
        check_name("passwd", line, name)?;
        if entries.iter().any(|e| e.name == name) {
            return Err(Error::corrupt("passwd", line, format!("duplicate account '{}'", name)));
        }
        entries.push(PasswdEntry {
            name: name.to_string(),
            placeholder: placeholder.to_string(),
            uid: parse_id("passwd", line, uid, "uid")?,
            gid: parse_id("passwd", line, gid, "gid")?,
            comment: comment.to_string(),
            home: home.to_string(),
            shell: shell.to_string(),
        });
    }
    Ok(entries)
}

fn parse_group(content: &str) -> Result<Vec<GroupEntry>> {
    let mut entries = Vec::new();
    for (line, fields) in rows(content) {
        let [name, placeholder, gid, members] = fields[..] else {
            return Err(Error::corrupt(
                "group",
                line,
                format!("expected 4 fields, found {}", fields.len()),
            ));
        };
        check_name("group", line, name)?;
        entries.push(GroupEntry {
            name: name.to_string(),
            placeholder: placeholder.to_string(),
            gid: parse_id("group", line, gid, "gid")?,
            members: members
                .split(',')
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect(),
        });
    }
    Ok(entries)
}

fn parse_shadow(content: &str) -> Result<Vec<ShadowEntry>> {
    let mut entries = Vec::new();
    for (line, fields) in rows(content) {
        if fields.len() != 9 {
            return Err(Error::corrupt(
                "shadow",
                line,
                format!("expected 9 fields, found {}", fields.len()),
            ));
        }
        check_name("shadow", line, fields[0])?;
        entries.push(ShadowEntry {
            name: fields[0].to_string(),
            hash: fields[1].to_string(),
            aging: fields[2..].iter().map(|f| f.to_string()).collect(),
        });
    }
    Ok(entries)
}

fn render_passwd(entries: &[PasswdEntry]) -> String {
    let mut out = String::new();
    for e in entries {
        let _ = writeln!(
            out,
            "{}:{}:{}:{}:{}:{}:{}",
            e.name, e.placeholder, e.uid, e.gid, e.comment, e.home, e.shell
        );
    }
    out
}

fn render_group(entries: &[GroupEntry]) -> String {
    let mut out = String::new();
    for e in entries {
        let _ = writeln!(
            out,
            "{}:{}:{}:{}",
            e.name,
            e.placeholder,
            e.gid,
            e.members.join(",")
        );
    }
    out
}

fn render_shadow(entries: &[ShadowEntry]) -> String {
    let mut out = String::new();
    for e in entries {
        let _ = writeln!(out, "{}:{}:{}", e.name, e.hash, e.aging.join(":"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha_crypt::sha512_check;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ChrootEnvironment) {
        let tmp = TempDir::new().unwrap();
        let env = ChrootEnvironment::new(tmp.path().join("root"));
        fs::create_dir_all(env.root()).unwrap();
        UserRegistry::new(&env).reset_to_baseline().unwrap();
        (tmp, env)
    }

    fn count_rows(env: &ChrootEnvironment, table: &str, name: &str) -> usize {
        fs::read_to_string(env.inside(table))
            .unwrap()
            .lines()
            .filter(|l| l.split(':').next() == Some(name))
            .count()
    }

    #[test]
    fn test_baseline_has_locked_root_only() -> Result<()> {
        let (_tmp, env) = setup();
        let accounts = UserRegistry::new(&env).list_accounts()?;

        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].username, "root");
        assert_eq!(accounts[0].uid, 0);
        assert!(crypt::is_locked(&accounts[0].password_hash));
        assert_eq!(
            fs::read_to_string(env.inside("/etc/passwd")).unwrap(),
            "root:x:0:0:root:/root:/bin/bash\n"
        );
        assert_eq!(
            fs::read_to_string(env.inside("/etc/group")).unwrap(),
            "root:x:0:\n"
        );
        Ok(())
    }

    #[test]
    fn test_create_allocates_consistent_ids() -> Result<()> {
        let (_tmp, env) = setup();
        let registry = UserRegistry::new(&env);

        let alice = registry.create_account("alice", "pw-a")?;
        let bob = registry.create_account("bob", "pw-b")?;

        assert_eq!(alice.uid, 1000);
        assert_eq!(bob.uid, 1001);
        for user in [&alice, &bob] {
            assert!(user.uid >= FIRST_UID);
            assert_eq!(user.uid, user.gid);
            let group = fs::read_to_string(env.inside("/etc/group")).unwrap();
            assert!(group.contains(&format!("{}:x:{}:", user.username, user.gid)));
            let passwd = fs::read_to_string(env.inside("/etc/passwd")).unwrap();
            assert!(passwd.contains(&format!(
                "{0}:x:{1}:{1}:{0}:/home/{0}:/bin/bash",
                user.username, user.uid
            )));
        }
        assert!(sha512_check("pw-a", &alice.password_hash).is_ok());
        Ok(())
    }

    #[test]
    fn test_create_duplicate_leaves_one_row() -> Result<()> {
        let (_tmp, env) = setup();
        let registry = UserRegistry::new(&env);

        let bob = registry.create_account("bob", "secret")?;
        assert_eq!(bob.uid, 1000);

        let again = registry.create_account("bob", "other");
        assert!(matches!(again, Err(Error::DuplicateAccount(ref n)) if n == "bob"));

        for table in ["/etc/passwd", "/etc/group", "/etc/shadow"] {
            assert_eq!(count_rows(&env, table, "bob"), 1, "{}", table);
        }
        Ok(())
    }

    #[test]
    fn test_create_prepares_home() -> Result<()> {
        use std::os::unix::fs::MetadataExt;

        let (_tmp, env) = setup();
        UserRegistry::new(&env).create_account("carol", "pw")?;

        let home = env.home_of("carol");
        assert_eq!(fs::metadata(&home).unwrap().mode() & 0o777, 0o700);
        assert!(home.join(".profile").is_file());
        assert!(home.join(".bashrc").is_file());
        if geteuid().is_root() {
            assert_eq!(fs::metadata(&home).unwrap().uid(), 1000);
        }
        Ok(())
    }

    #[test]
    fn test_lowest_free_uid_is_reused() -> Result<()> {
        let (_tmp, env) = setup();
        fs::write(
            env.inside("/etc/passwd"),
            "root:x:0:0:root:/root:/bin/bash\nold:x:1001:1001::/home/old:/bin/sh\n",
        )
        .unwrap();
        fs::write(
            env.inside("/etc/shadow"),
            "root:*:19000:0:99999:7:::\nold:!:19000:0:99999:7:::\n",
        )
        .unwrap();

        let user = UserRegistry::new(&env).create_account("new", "pw")?;
        assert_eq!(user.uid, 1000);
        Ok(())
    }

    #[test]
    fn test_invalid_name_rejected() {
        let (_tmp, env) = setup();
        let registry = UserRegistry::new(&env);
        let long = "x".repeat(33);
        for name in ["", "Root", "9lives", "a:b", "with space", long.as_str()] {
            assert!(
                matches!(registry.create_account(name, "pw"), Err(Error::InvalidAccountName(_))),
                "{:?}",
                name
            );
        }
    }

    #[test]
    fn test_non_numeric_uid_is_corrupt() {
        let (_tmp, env) = setup();
        fs::write(
            env.inside("/etc/passwd"),
            "root:x:0:0:root:/root:/bin/bash\nbad:x:abc:1000::/home/bad:/bin/sh\n",
        )
        .unwrap();

        let err = UserRegistry::new(&env).list_accounts().unwrap_err();
        assert!(matches!(err, Error::RegistryCorrupt { table: "passwd", line: 2, .. }));
    }

    #[test]
    fn test_wrong_field_count_is_corrupt() {
        let (_tmp, env) = setup();
        fs::write(env.inside("/etc/group"), "root:x:0\n").unwrap();

        let err = UserRegistry::new(&env).list_accounts().unwrap_err();
        assert!(matches!(err, Error::RegistryCorrupt { table: "group", line: 1, .. }));
    }

    #[test]
    fn test_missing_shadow_entry_is_corrupt() {
        let (_tmp, env) = setup();
        fs::write(
            env.inside("/etc/passwd"),
            "root:x:0:0:root:/root:/bin/bash\nghost:x:1000:1000::/home/ghost:/bin/sh\n",
        )
        .unwrap();

        let err = UserRegistry::new(&env).list_accounts().unwrap_err();
        assert!(matches!(err, Error::RegistryCorrupt { table: "shadow", .. }));
    }

    #[test]
    fn test_orphan_shadow_row_is_tolerated_and_replaced() -> Result<()> {
        let (_tmp, env) = setup();
        fs::write(
            env.inside("/etc/shadow"),
            "root:*:19000:0:99999:7:::\ndan:$6$x$y:19000:0:99999:7:::\n",
        )
        .unwrap();

        let registry = UserRegistry::new(&env);
        assert_eq!(registry.list_accounts()?.len(), 1);

        registry.create_account("dan", "pw")?;
        assert_eq!(count_rows(&env, "/etc/shadow", "dan"), 1);
        Ok(())
    }

    #[test]
    fn test_set_password() -> Result<()> {
        let (_tmp, env) = setup();
        let registry = UserRegistry::new(&env);
        registry.create_account("erin", "old")?;

        registry.set_password("erin", "new")?;
        let erin = registry.find("erin")?;
        assert!(sha512_check("new", &erin.password_hash).is_ok());
        assert!(sha512_check("old", &erin.password_hash).is_err());

        assert!(matches!(
            registry.set_password("nobody", "x"),
            Err(Error::AccountNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_export_reset_import_roundtrip() -> Result<()> {
        let (_tmp, env) = setup();
        let registry = UserRegistry::new(&env);
        registry.create_account("alice", "a")?;
        registry.create_account("bob", "b")?;
        let before: Vec<UserRecord> = registry
            .list_accounts()?
            .into_iter()
            .filter(UserRecord::is_sandbox_account)
            .collect();

        let exported = registry.export_accounts()?;
        assert_eq!(exported.len(), 2);

        registry.reset_to_baseline()?;
        assert_eq!(registry.list_accounts()?.len(), 1);

        for account in &exported {
            registry.import_account(account)?;
        }
        let after: Vec<UserRecord> = registry
            .list_accounts()?
            .into_iter()
            .filter(UserRecord::is_sandbox_account)
            .collect();

        assert_eq!(before, after);
        Ok(())
    }

    #[test]
    fn test_find_missing_account() {
        let (_tmp, env) = setup();
        assert!(matches!(
            UserRegistry::new(&env).find("alice"),
            Err(Error::AccountNotFound(_))
        ));
    }

    #[test]
    fn test_render_parse_shadow_fields() -> Result<()> {
        let parsed = parse_shadow("root:*:19000:0:99999:7:::\n")?;
        assert_eq!(parsed[0].aging.len(), 7);
        assert_eq!(render_shadow(&parsed), "root:*:19000:0:99999:7:::\n");
        Ok(())
    }
}
