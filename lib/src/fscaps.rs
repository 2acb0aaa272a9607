//! File capabilities: parsing the textual form used in package headers
//! and encoding it as the `security.capability` extended attribute.

use std::str::FromStr;

use crate::Error;

/// Name of the extended attribute holding file capabilities.
pub const XATTR_NAME: &str = "security.capability";

const VFS_CAP_REVISION_2: u32 = 0x0200_0000;
const VFS_CAP_FLAGS_EFFECTIVE: u32 = 0x1;

/// Capability names, indexed by capability number.
const NAMES: &[&str] = &[
    "chown",
    "dac_override",
    "dac_read_search",
    "fowner",
    "fsetid",
    "kill",
    "setgid",
    "setuid",
    "setpcap",
    "linux_immutable",
    "net_bind_service",
    "net_broadcast",
    "net_admin",
    "net_raw",
    "ipc_lock",
    "ipc_owner",
    "sys_module",
    "sys_rawio",
    "sys_chroot",
    "sys_ptrace",
    "sys_pacct",
    "sys_admin",
    "sys_boot",
    "sys_nice",
    "sys_resource",
    "sys_time",
    "sys_tty_config",
    "mknod",
    "lease",
    "audit_write",
    "audit_control",
    "setfcap",
    "mac_override",
    "mac_admin",
    "syslog",
    "wake_alarm",
    "block_suspend",
    "audit_read",
    "perfmon",
    "bpf",
    "checkpoint_restore",
];

fn all_caps() -> u64 {
    (1u64 << NAMES.len()) - 1
}

/// A file capability set.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FileCaps {
    /// Effective set
    pub effective: u64,
    /// Permitted set
    pub permitted: u64,
    /// Inheritable set
    pub inheritable: u64,
}

fn cap_bit(name: &str) -> Option<u64> {
    let name = name.to_ascii_lowercase();
    if let Ok(n) = name.parse::<u32>() {
        return (n < 64).then(|| 1u64 << n);
    }
    let name = name.strip_prefix("cap_")?;
    NAMES
        .iter()
        .position(|&v| v == name)
        .map(|i| 1u64 << i)
}

impl FileCaps {
    /// Whether all sets are empty.
    pub fn is_empty(&self) -> bool {
        self.effective == 0 && self.permitted == 0 && self.inheritable == 0
    }

    /// Encode as a revision 2 `vfs_cap_data` structure.
    pub fn to_xattr(&self) -> Vec<u8> {
        let mut magic = VFS_CAP_REVISION_2;
        if self.effective != 0 {
            magic |= VFS_CAP_FLAGS_EFFECTIVE;
        }
        let mut r = Vec::with_capacity(20);
        r.extend_from_slice(&magic.to_le_bytes());
        for shift in [0, 32] {
            r.extend_from_slice(&((self.permitted >> shift) as u32).to_le_bytes());
            r.extend_from_slice(&((self.inheritable >> shift) as u32).to_le_bytes());
        }
        r
    }

    fn apply(&mut self, caps: u64, op: char, flags: &str) -> Result<(), ()> {
        let mut sets = [false; 3];
        for f in flags.chars() {
            match f {
                'e' => sets[0] = true,
                'p' => sets[1] = true,
                'i' => sets[2] = true,
                _ => return Err(()),
            }
        }
        let targets = [&mut self.effective, &mut self.permitted, &mut self.inheritable];
        for (set, selected) in targets.into_iter().zip(sets) {
            match op {
                '=' => {
                    *set &= !caps;
                    if selected {
                        *set |= caps;
                    }
                }
                '+' if selected => *set |= caps,
                '-' if selected => *set &= !caps,
                _ => {}
            }
        }
        Ok(())
    }
}

/// Parses the `cap_from_text(3)` syntax: whitespace separated clauses of
/// a comma separated capability list followed by one or more operator
/// (`=`, `+`, `-`) and flag (`e`, `i`, `p`) groups.
impl FromStr for FileCaps {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidCapabilities(s.to_string());
        let mut r = FileCaps::default();
        for clause in s.split_whitespace() {
            let idx = clause.find(['=', '+', '-']).ok_or_else(invalid)?;
            let (names, mut ops) = clause.split_at(idx);
            let caps = if names.is_empty() || names.eq_ignore_ascii_case("all") {
                all_caps()
            } else {
                names
                    .split(',')
                    .map(cap_bit)
                    .try_fold(0u64, |acc, b| b.map(|b| acc | b))
                    .ok_or_else(invalid)?
            };
            // An empty list is only valid with `=`, meaning "all".
            if names.is_empty() && !ops.starts_with('=') {
                return Err(invalid());
            }
            while let Some(op) = ops.chars().next() {
                let rest = &ops[1..];
                let end = rest.find(['=', '+', '-']).unwrap_or(rest.len());
                let flags = &rest[..end];
                if op != '=' && flags.is_empty() {
                    return Err(invalid());
                }
                r.apply(caps, op, flags).map_err(|_| invalid())?;
                ops = &rest[end..];
            }
        }
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let bind = 1u64 << 10;
        let c: FileCaps = "cap_net_bind_service=ep".parse().unwrap();
        assert_eq!(
            c,
            FileCaps {
                effective: bind,
                permitted: bind,
                inheritable: 0
            }
        );
        assert_eq!(c, "cap_net_bind_service=+ep".parse().unwrap());
        assert_eq!(c, "CAP_NET_BIND_SERVICE+pe".parse().unwrap());

        let c: FileCaps = "cap_setuid,cap_setgid=ep cap_setgid-e".parse().unwrap();
        assert_eq!(c.permitted, (1 << 6) | (1 << 7));
        assert_eq!(c.effective, 1 << 7);

        let c: FileCaps = "=p cap_sys_admin-p".parse().unwrap();
        assert_eq!(c.permitted, all_caps() & !(1 << 21));
        assert_eq!(c.effective, 0);

        let c: FileCaps = "cap_checkpoint_restore=i".parse().unwrap();
        assert_eq!(c.inheritable, 1 << 40);

        let c: FileCaps = "".parse().unwrap();
        assert!(c.is_empty());
    }

    #[test]
    fn test_parse_invalid() {
        for v in ["cap_bogus=ep", "cap_chown", "cap_chown=ex", "cap_chown+", "+ep", "cap_chown,=p", "64=p"] {
            let e = v.parse::<FileCaps>().unwrap_err();
            assert!(matches!(e, Error::InvalidCapabilities(_)), "{v}");
        }
    }

    #[test]
    fn test_xattr() {
        let c: FileCaps = "cap_net_bind_service=ep".parse().unwrap();
        assert_eq!(
            c.to_xattr(),
            [
                0x01, 0x00, 0x00, 0x02, // magic with effective flag
                0x00, 0x04, 0x00, 0x00, // permitted, low
                0x00, 0x00, 0x00, 0x00, // inheritable, low
                0x00, 0x00, 0x00, 0x00, // permitted, high
                0x00, 0x00, 0x00, 0x00, // inheritable, high
            ]
        );
        let c: FileCaps = "cap_mac_admin=p".parse().unwrap();
        let x = c.to_xattr();
        assert_eq!(&x[0..4], &[0, 0, 0, 2]);
        assert_eq!(&x[12..16], &[0x02, 0, 0, 0]);
    }
}
