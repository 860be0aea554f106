/// Maximum length of a metric/variable name.
pub const VAR_NAME_MAX: usize = 63;

/// Collectors a session can enable. Each runs at most once per session
/// (multi-target collectors run once per configured target).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collector {
    Time,
    Uname,
    Version,
    Uptime,
    Netstat,
    Ifaddrs,
    Vmstat,
    Sysctl,
    Swap,
    AcpiTemperature,
    Apache,
    Nginx,
    Memcache,
    Socket,
    Exec,
    Cputemp,
    HddLoad,
    Smart,
    Df,
}

pub const COLLECTOR_COUNT: usize = 19;

impl Collector {
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Fixed execution order. Fast local collectors first; collectors that
/// spawn sub-target workers next (they return immediately); collectors
/// known to block on hardware or many syscalls last, with DF at the very
/// end.
pub const EXECUTION_ORDER: [Collector; COLLECTOR_COUNT] = [
    Collector::Time,
    Collector::Uname,
    Collector::Version,
    Collector::Uptime,
    Collector::Netstat,
    Collector::Ifaddrs,
    Collector::Vmstat,
    Collector::Sysctl,
    Collector::Swap,
    Collector::AcpiTemperature,
    Collector::Apache,
    Collector::Nginx,
    Collector::Memcache,
    Collector::Socket,
    Collector::Exec,
    Collector::Cputemp,
    Collector::HddLoad,
    Collector::Smart,
    Collector::Df,
];

/// What a recognized directive does to the request being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKind {
    /// Enables exactly one collector; no arguments allowed.
    Toggle(Collector),
    /// `TIME <unsigned>`: sets the session reference time.
    Time,
    /// `DEBUG <0|1|2>`: sets session verbosity.
    Debug,
    /// `SYSCTL <var>`: appends to the bounded variable list.
    Sysctl,
    /// `SMART <attr-id>|ALL`: enables SMART and selects attributes.
    Smart,
    /// Ends collection and starts execution.
    Go,
    /// Ends the session silently.
    Quit,
    /// Prints the directive list to the client.
    Help,
}

pub struct DirectiveSpec {
    pub keyword: &'static str,
    pub kind: DirectiveKind,
    pub help: &'static str,
}

/// The protocol's static directive table. Keywords are case-sensitive.
pub const DIRECTIVES: &[DirectiveSpec] = &[
    DirectiveSpec {
        keyword: "VERSION",
        kind: DirectiveKind::Toggle(Collector::Version),
        help: "report daemon version",
    },
    DirectiveSpec {
        keyword: "TIME",
        kind: DirectiveKind::Time,
        help: "<seconds> set reference time, report time and local skew",
    },
    DirectiveSpec {
        keyword: "DEBUG",
        kind: DirectiveKind::Debug,
        help: "<0|1|2> set session verbosity",
    },
    DirectiveSpec {
        keyword: "UNAME",
        kind: DirectiveKind::Toggle(Collector::Uname),
        help: "report kernel name, release, version, machine",
    },
    DirectiveSpec {
        keyword: "UPTIME",
        kind: DirectiveKind::Toggle(Collector::Uptime),
        help: "report uptime and load averages",
    },
    DirectiveSpec {
        keyword: "VMSTAT",
        kind: DirectiveKind::Toggle(Collector::Vmstat),
        help: "report CPU time counters",
    },
    DirectiveSpec {
        keyword: "SYSCTL",
        kind: DirectiveKind::Sysctl,
        help: "<variable> report one kernel parameter",
    },
    DirectiveSpec {
        keyword: "SWAP",
        kind: DirectiveKind::Toggle(Collector::Swap),
        help: "report swap total and usage",
    },
    DirectiveSpec {
        keyword: "ACPI_TEMPERATURE",
        kind: DirectiveKind::Toggle(Collector::AcpiTemperature),
        help: "report thermal zone temperatures",
    },
    DirectiveSpec {
        keyword: "CPUTEMP",
        kind: DirectiveKind::Toggle(Collector::Cputemp),
        help: "report hardware sensor temperatures",
    },
    DirectiveSpec {
        keyword: "DF",
        kind: DirectiveKind::Toggle(Collector::Df),
        help: "report filesystem sizes and usage",
    },
    DirectiveSpec {
        keyword: "NETSTAT",
        kind: DirectiveKind::Toggle(Collector::Netstat),
        help: "report accumulated interface counters",
    },
    DirectiveSpec {
        keyword: "IFADDRS",
        kind: DirectiveKind::Toggle(Collector::Ifaddrs),
        help: "report interface addresses",
    },
    DirectiveSpec {
        keyword: "SOCKET",
        kind: DirectiveKind::Toggle(Collector::Socket),
        help: "report monitored socket queue statistics",
    },
    DirectiveSpec {
        keyword: "HDDLOAD",
        kind: DirectiveKind::Toggle(Collector::HddLoad),
        help: "report 5/15 minute disk load",
    },
    DirectiveSpec {
        keyword: "SMART",
        kind: DirectiveKind::Smart,
        help: "<attr-id>|ALL report SMART status and attributes",
    },
    DirectiveSpec {
        keyword: "APACHE",
        kind: DirectiveKind::Toggle(Collector::Apache),
        help: "report configured apache status pages",
    },
    DirectiveSpec {
        keyword: "NGINX",
        kind: DirectiveKind::Toggle(Collector::Nginx),
        help: "report configured nginx status pages",
    },
    DirectiveSpec {
        keyword: "MEMCACHE",
        kind: DirectiveKind::Toggle(Collector::Memcache),
        help: "report configured memcache server statistics",
    },
    DirectiveSpec {
        keyword: "EXEC",
        kind: DirectiveKind::Toggle(Collector::Exec),
        help: "report configured command output",
    },
    DirectiveSpec {
        keyword: "HELP",
        kind: DirectiveKind::Help,
        help: "print this list",
    },
    DirectiveSpec {
        keyword: "QUIT",
        kind: DirectiveKind::Quit,
        help: "close the session without output",
    },
    DirectiveSpec {
        keyword: "GO",
        kind: DirectiveKind::Go,
        help: "run the enabled collectors and close",
    },
];

pub fn lookup(keyword: &str) -> Option<&'static DirectiveSpec> {
    DIRECTIVES.iter().find(|d| d.keyword == keyword)
}

/// The HELP response body.
pub fn help_text() -> String {
    let mut out = String::new();
    for d in DIRECTIVES {
        out.push_str(&format!("{:<18} {}\n", d.keyword, d.help));
    }
    out
}

/// Metric/variable names: `[A-Za-z0-9._%]`, 1 to 63 bytes.
pub fn valid_var_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= VAR_NAME_MAX
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'%'))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_lookup_is_case_sensitive() {
        assert!(lookup("VERSION").is_some());
        assert!(lookup("version").is_none());
        assert!(lookup("NO_SUCH").is_none());
    }

    #[test]
    fn test_every_collector_appears_once_in_order() {
        let set: HashSet<Collector> = EXECUTION_ORDER.iter().copied().collect();
        assert_eq!(set.len(), EXECUTION_ORDER.len());
        assert_eq!(set.len(), COLLECTOR_COUNT);
    }

    #[test]
    fn test_slow_collectors_run_last() {
        let pos = |c: Collector| {
            EXECUTION_ORDER
                .iter()
                .position(|x| *x == c)
                .expect("in order")
        };
        assert_eq!(pos(Collector::Df), COLLECTOR_COUNT - 1);
        assert!(pos(Collector::Smart) > pos(Collector::Exec));
        // Sub-worker spawners come after the quick local set.
        assert!(pos(Collector::Apache) > pos(Collector::Sysctl));
        assert!(pos(Collector::HddLoad) > pos(Collector::Exec));
    }

    #[test]
    fn test_every_toggle_maps_to_ordered_collector() {
        for d in DIRECTIVES {
            if let DirectiveKind::Toggle(c) = d.kind {
                assert!(
                    EXECUTION_ORDER.contains(&c),
                    "{} not in execution order",
                    d.keyword
                );
            }
        }
    }

    #[test]
    fn test_help_lists_all_keywords() {
        let help = help_text();
        for d in DIRECTIVES {
            assert!(help.contains(d.keyword));
        }
    }

    #[test]
    fn test_valid_var_name() {
        assert!(valid_var_name("kern.ostype"));
        assert!(valid_var_name("vm.stats.vm.v_page_count"));
        assert!(valid_var_name("cache_hit_%"));
        assert!(!valid_var_name(""));
        assert!(!valid_var_name("has space"));
        assert!(!valid_var_name("semi;colon"));
        assert!(!valid_var_name(&"x".repeat(VAR_NAME_MAX + 1)));
    }
}
