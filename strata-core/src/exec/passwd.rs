//! User and group resolution against the build rootfs.
//!
//! `USER`, `--chown` and `RUN` credentials are resolved against the
//! `/etc/passwd` and `/etc/group` of the image being built, not the
//! builder's own environment.

use std::path::Path;

use crate::error::{Result, StrataError};

/// A resolved user: numeric ids plus the home directory for `HOME`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUser {
    pub uid: u32,
    pub gid: u32,
    pub home: String,
}

/// Resolve `user[:group]` against the rootfs.
///
/// Numeric ids are accepted directly. A named user must exist in
/// `/etc/passwd`; a named group in `/etc/group`. Without a group, the
/// user's primary group applies.
pub fn lookup(root: &Path, user: &str, group: Option<&str>) -> Result<ResolvedUser> {
    let entry = match user.parse::<u32>() {
        Ok(uid) => passwd_by_uid(root, uid)?.unwrap_or(PasswdEntry {
            name: user.to_string(),
            uid,
            gid: uid,
            home: "/".to_string(),
        }),
        Err(_) => passwd_by_name(root, user)?.ok_or_else(|| StrataError::UserLookup {
            user: user.to_string(),
            reason: "not found in /etc/passwd".to_string(),
        })?,
    };

    let gid = match group {
        None => entry.gid,
        Some(g) => match g.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => group_by_name(root, g)?.ok_or_else(|| StrataError::UserLookup {
                user: format!("{user}:{g}"),
                reason: "group not found in /etc/group".to_string(),
            })?,
        },
    };

    Ok(ResolvedUser { uid: entry.uid, gid, home: entry.home })
}

/// Resolve the active user/group for file creation, falling back to 0/0
/// when no user is set or the rootfs has no account database yet.
pub fn active_user_group(root: &Path, user: &str) -> (u32, u32) {
    if user.is_empty() {
        return (0, 0);
    }
    let (user_part, group_part) = split_user_group(user);
    match lookup(root, user_part, group_part) {
        Ok(resolved) => (resolved.uid, resolved.gid),
        Err(_) => (0, 0),
    }
}

/// The `HOME` value for a resolved user string: `/root` for root or empty,
/// the passwd entry's home for named users, `/` for bare numeric ids.
pub fn home_for(root: &Path, user: &str) -> Result<String> {
    if user.is_empty() || user == "root" || user == "0" {
        return Ok("/root".to_string());
    }
    let (user_part, _) = split_user_group(user);
    match user_part.parse::<u32>() {
        Ok(uid) => Ok(passwd_by_uid(root, uid)?.map(|e| e.home).unwrap_or_else(|| "/".to_string())),
        Err(_) => Ok(lookup(root, user_part, None)?.home),
    }
}

/// Split `user[:group]`.
pub fn split_user_group(spec: &str) -> (&str, Option<&str>) {
    match spec.split_once(':') {
        Some((user, group)) => (user, Some(group)),
        None => (spec, None),
    }
}

struct PasswdEntry {
    #[allow(dead_code)]
    name: String,
    uid: u32,
    gid: u32,
    home: String,
}

fn parse_passwd_line(line: &str) -> Option<PasswdEntry> {
    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() < 6 {
        return None;
    }
    Some(PasswdEntry {
        name: fields[0].to_string(),
        uid: fields[2].parse().ok()?,
        gid: fields[3].parse().ok()?,
        home: fields[5].to_string(),
    })
}

fn read_passwd(root: &Path) -> Result<Vec<PasswdEntry>> {
    let path = root.join("etc/passwd");
    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(contents.lines().filter_map(parse_passwd_line).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(StrataError::io(&path, e)),
    }
}

fn passwd_by_name(root: &Path, name: &str) -> Result<Option<PasswdEntry>> {
    Ok(read_passwd(root)?.into_iter().find(|e| e.name == name))
}

fn passwd_by_uid(root: &Path, uid: u32) -> Result<Option<PasswdEntry>> {
    Ok(read_passwd(root)?.into_iter().find(|e| e.uid == uid))
}

fn group_by_name(root: &Path, name: &str) -> Result<Option<u32>> {
    let path = root.join("etc/group");
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StrataError::io(&path, e)),
    };
    Ok(contents.lines().find_map(|line| {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() >= 3 && fields[0] == name {
            fields[2].parse().ok()
        } else {
            None
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rootfs_with_accounts() -> TempDir {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("etc")).unwrap();
        std::fs::write(
            tmp.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\napp:x:1000:1000:app:/home/app:/bin/sh\n",
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("etc/group"),
            "root:x:0:\napp:x:1000:\nwheel:x:10:app\n",
        )
        .unwrap();
        tmp
    }

    #[test]
    fn test_lookup_by_name() {
        let root = rootfs_with_accounts();
        let user = lookup(root.path(), "app", None).unwrap();
        assert_eq!(user, ResolvedUser { uid: 1000, gid: 1000, home: "/home/app".into() });
    }

    #[test]
    fn test_lookup_with_group() {
        let root = rootfs_with_accounts();
        let user = lookup(root.path(), "app", Some("wheel")).unwrap();
        assert_eq!(user.gid, 10);

        let user = lookup(root.path(), "app", Some("42")).unwrap();
        assert_eq!(user.gid, 42);
    }

    #[test]
    fn test_lookup_numeric_uid_without_passwd_entry() {
        let root = rootfs_with_accounts();
        let user = lookup(root.path(), "4242", None).unwrap();
        assert_eq!(user.uid, 4242);
        assert_eq!(user.gid, 4242);
        assert_eq!(user.home, "/");
    }

    #[test]
    fn test_unknown_named_user_errors() {
        let root = rootfs_with_accounts();
        assert!(lookup(root.path(), "ghost", None).is_err());
    }

    #[test]
    fn test_active_user_group_fallback() {
        let root = rootfs_with_accounts();
        assert_eq!(active_user_group(root.path(), ""), (0, 0));
        assert_eq!(active_user_group(root.path(), "ghost"), (0, 0));
        assert_eq!(active_user_group(root.path(), "app"), (1000, 1000));
        assert_eq!(active_user_group(root.path(), "app:wheel"), (1000, 10));
    }

    #[test]
    fn test_home_resolution() {
        let root = rootfs_with_accounts();
        assert_eq!(home_for(root.path(), "").unwrap(), "/root");
        assert_eq!(home_for(root.path(), "root").unwrap(), "/root");
        assert_eq!(home_for(root.path(), "app").unwrap(), "/home/app");
        assert_eq!(home_for(root.path(), "12345").unwrap(), "/");
    }

    #[test]
    fn test_missing_passwd_file() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(active_user_group(tmp.path(), "anyone"), (0, 0));
    }
}
