//! Raw sample to canonical event mapping.
//!
//! Normalization is total: every raw sample yields a complete event.
//! Absent strings become `"unknown"` for identity fields (names, users,
//! protocol) and empty otherwise; out-of-range numbers are coerced to zero.
//! Extension fields are filled from a per-platform table so a consumer
//! always sees the same keys for a given (platform, kind).

use crate::probe::{Extras, RawConnection, RawFile, RawProcess, RawSample};
use chrono::{DateTime, Utc};
use edr_common::{
    CanonicalEvent, EventFields, EventKind, FileFields, NetworkFields, PlatformTag, ProcessFields,
    UNKNOWN,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

/// Default value of one extension field.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ExtDefault {
    Str(&'static str),
    Int(i64),
}

impl ExtDefault {
    fn to_value(self) -> Value {
        match self {
            ExtDefault::Str(s) => Value::from(s),
            ExtDefault::Int(n) => Value::from(n),
        }
    }

    /// Whether a probe-supplied value has the right JSON type.
    fn accepts(self, value: &Value) -> bool {
        match self {
            ExtDefault::Str(_) => value.is_string(),
            ExtDefault::Int(_) => value.is_i64() || value.is_u64(),
        }
    }
}

const WINDOWS_PROCESS: &[(&str, ExtDefault)] = &[
    ("SignatureStatus", ExtDefault::Str(UNKNOWN)),
    ("CompanyName", ExtDefault::Str(UNKNOWN)),
];

const LINUX_PROCESS: &[(&str, ExtDefault)] = &[
    ("GroupName", ExtDefault::Str(UNKNOWN)),
    ("State", ExtDefault::Str(UNKNOWN)),
    ("Threads", ExtDefault::Int(0)),
    ("Priority", ExtDefault::Int(0)),
    ("Nice", ExtDefault::Int(0)),
];

const LINUX_FILE: &[(&str, ExtDefault)] = &[
    ("Owner", ExtDefault::Str(UNKNOWN)),
    ("Group", ExtDefault::Str(UNKNOWN)),
    ("Permissions", ExtDefault::Str("")),
    ("Inode", ExtDefault::Int(0)),
    ("Device", ExtDefault::Int(0)),
    ("HardLinks", ExtDefault::Int(0)),
    ("LastModified", ExtDefault::Str("")),
    ("LastAccessed", ExtDefault::Str("")),
];

const LINUX_NETWORK: &[(&str, ExtDefault)] = &[
    ("Status", ExtDefault::Str("")),
    ("RemoteHostname", ExtDefault::Str("")),
    ("BytesSent", ExtDefault::Int(0)),
    ("BytesReceived", ExtDefault::Int(0)),
];

fn extension_table(platform: PlatformTag, kind: EventKind) -> &'static [(&'static str, ExtDefault)] {
    match (platform, kind) {
        (PlatformTag::Windows, EventKind::Process) => WINDOWS_PROCESS,
        (PlatformTag::Linux, EventKind::Process) => LINUX_PROCESS,
        (PlatformTag::Linux, EventKind::File) => LINUX_FILE,
        (PlatformTag::Linux, EventKind::Network) => LINUX_NETWORK,
        _ => &[],
    }
}

/// Keys known for (platform, kind), taking probe values of matching type.
fn extension_fields(
    platform: PlatformTag,
    kind: EventKind,
    extras: &Extras,
) -> BTreeMap<String, Value> {
    extension_table(platform, kind)
        .iter()
        .map(|(key, default)| {
            let value = extras
                .get(*key)
                .filter(|v| default.accepts(v))
                .cloned()
                .unwrap_or_else(|| default.to_value());
            (key.to_string(), value)
        })
        .collect()
}

fn pid(value: Option<i64>) -> u32 {
    value.and_then(|v| u32::try_from(v).ok()).unwrap_or(0)
}

fn port(value: Option<i64>) -> u16 {
    value.and_then(|v| u16::try_from(v).ok()).unwrap_or(0)
}

fn size(value: Option<i64>) -> u64 {
    value.and_then(|v| u64::try_from(v).ok()).unwrap_or(0)
}

fn cpu(value: Option<f64>) -> f64 {
    match value {
        Some(v) if v.is_finite() && v >= 0.0 => v,
        _ => 0.0,
    }
}

fn text(value: Option<String>) -> String {
    value.unwrap_or_default()
}

fn label(value: Option<String>) -> String {
    value
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Stamps raw samples with host identity and canonical shape.
#[derive(Debug, Clone)]
pub struct Normalizer {
    hostname: String,
    platform: PlatformTag,
}

impl Normalizer {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self::for_platform(hostname, PlatformTag::current())
    }

    pub fn for_platform(hostname: impl Into<String>, platform: PlatformTag) -> Self {
        Self {
            hostname: hostname.into(),
            platform,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn platform(&self) -> PlatformTag {
        self.platform
    }

    pub fn normalize(&self, raw: RawSample) -> CanonicalEvent {
        self.normalize_at(raw, self.platform, Utc::now())
    }

    /// Normalize with an explicit platform tag and fallback timestamp.
    pub fn normalize_at(
        &self,
        raw: RawSample,
        platform: PlatformTag,
        now: DateTime<Utc>,
    ) -> CanonicalEvent {
        let kind = raw.kind();
        let (timestamp, fields, extras) = match raw {
            RawSample::Process(mut p) => {
                let (ts, extras) = (p.timestamp, std::mem::take(&mut p.extras));
                (ts, EventFields::Process(process_fields(p)), extras)
            }
            RawSample::Network(mut n) => {
                let (ts, extras) = (n.timestamp, std::mem::take(&mut n.extras));
                (ts, EventFields::Network(network_fields(n)), extras)
            }
            RawSample::File(mut f) => {
                let (ts, extras) = (f.timestamp, std::mem::take(&mut f.extras));
                (ts, EventFields::File(file_fields(f)), extras)
            }
        };

        CanonicalEvent {
            event_id: Uuid::new_v4(),
            timestamp: timestamp.unwrap_or(now),
            hostname: self.hostname.clone(),
            os_type: platform,
            fields,
            os_variant_fields: extension_fields(platform, kind, &extras),
        }
    }
}

fn process_fields(raw: RawProcess) -> ProcessFields {
    ProcessFields {
        pid: pid(raw.pid),
        ppid: pid(raw.ppid),
        name: label(raw.name),
        command_line: text(raw.command_line),
        executable_path: text(raw.executable_path),
        user: label(raw.user),
        cpu_percent: cpu(raw.cpu_percent),
        memory_bytes: size(raw.memory_bytes),
        hash: text(raw.hash),
    }
}

fn network_fields(raw: RawConnection) -> NetworkFields {
    NetworkFields {
        pid: pid(raw.pid),
        process_name: label(raw.process_name),
        protocol: label(raw.protocol),
        local_address: text(raw.local_address),
        local_port: port(raw.local_port),
        remote_address: text(raw.remote_address),
        remote_port: port(raw.remote_port),
        direction: raw.direction.unwrap_or_default(),
    }
}

fn file_fields(raw: RawFile) -> FileFields {
    let path = text(raw.path);
    let name = match raw.name.filter(|n| !n.is_empty()) {
        Some(name) => name,
        None => basename(&path),
    };
    FileFields {
        name,
        path,
        size: size(raw.size),
        hash: text(raw.hash),
        event_type: raw.event_type.unwrap_or_default(),
        pid: pid(raw.pid),
        process_name: label(raw.process_name),
        user: label(raw.user),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edr_common::{Direction, FileEventType};
    use proptest::prelude::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_empty_process_gets_defaults() {
        let normalizer = Normalizer::for_platform("host-a", PlatformTag::Linux);
        let event = normalizer.normalize_at(
            RawSample::Process(RawProcess::default()),
            PlatformTag::Linux,
            now(),
        );
        assert_eq!(event.hostname, "host-a");
        assert_eq!(event.timestamp, now());
        assert_eq!(event.kind(), EventKind::Process);
        let EventFields::Process(p) = &event.fields else {
            panic!("expected process fields");
        };
        assert_eq!(p.pid, 0);
        assert_eq!(p.name, UNKNOWN);
        assert_eq!(p.command_line, "");
        assert_eq!(p.cpu_percent, 0.0);
        assert_eq!(event.os_variant_fields["State"], UNKNOWN);
        assert_eq!(event.os_variant_fields["Threads"], 0);
        assert_eq!(event.os_variant_fields.len(), 5);
    }

    #[test]
    fn test_numeric_coercion() {
        let normalizer = Normalizer::for_platform("h", PlatformTag::Linux);
        let raw = RawSample::Process(RawProcess {
            pid: Some(-5),
            ppid: Some(i64::from(u32::MAX) + 1),
            cpu_percent: Some(f64::NAN),
            memory_bytes: Some(-1),
            ..RawProcess::default()
        });
        let EventFields::Process(p) = normalizer.normalize_at(raw, PlatformTag::Linux, now()).fields
        else {
            panic!("expected process fields");
        };
        assert_eq!((p.pid, p.ppid, p.memory_bytes), (0, 0, 0));
        assert_eq!(p.cpu_percent, 0.0);

        let raw = RawSample::Network(RawConnection {
            local_port: Some(70_000),
            remote_port: Some(443),
            direction: Some(Direction::Outbound),
            ..RawConnection::default()
        });
        let EventFields::Network(n) = normalizer.normalize_at(raw, PlatformTag::Linux, now()).fields
        else {
            panic!("expected network fields");
        };
        assert_eq!(n.local_port, 0);
        assert_eq!(n.remote_port, 443);
        assert_eq!(n.protocol, UNKNOWN);
        assert_eq!(n.direction, Direction::Outbound);
    }

    #[test]
    fn test_file_name_from_path() {
        let normalizer = Normalizer::for_platform("h", PlatformTag::Linux);
        let raw = RawSample::File(RawFile {
            path: Some("/var/log/auth.log".into()),
            event_type: Some(FileEventType::Modified),
            ..RawFile::default()
        });
        let event = normalizer.normalize_at(raw, PlatformTag::Linux, now());
        let EventFields::File(f) = &event.fields else {
            panic!("expected file fields");
        };
        assert_eq!(f.name, "auth.log");
        assert_eq!(f.event_type, FileEventType::Modified);
        assert_eq!(event.os_variant_fields["Owner"], UNKNOWN);
        assert_eq!(event.os_variant_fields["Inode"], 0);
    }

    #[test]
    fn test_extension_fields_follow_platform() {
        let normalizer = Normalizer::for_platform("h", PlatformTag::Linux);
        let mut extras = Extras::new();
        extras.insert("State".into(), json!("running"));
        extras.insert("Threads".into(), json!("many"));
        extras.insert("Unrelated".into(), json!(1));
        let raw = RawProcess {
            extras,
            ..RawProcess::default()
        };

        let linux = normalizer.normalize_at(RawSample::Process(raw.clone()), PlatformTag::Linux, now());
        assert_eq!(linux.os_variant_fields["State"], "running");
        // Wrong type falls back to the default.
        assert_eq!(linux.os_variant_fields["Threads"], 0);
        assert!(!linux.os_variant_fields.contains_key("Unrelated"));

        let windows = normalizer.normalize_at(RawSample::Process(raw.clone()), PlatformTag::Windows, now());
        assert_eq!(windows.os_variant_fields["SignatureStatus"], UNKNOWN);
        assert_eq!(windows.os_variant_fields["CompanyName"], UNKNOWN);
        assert!(!windows.os_variant_fields.contains_key("State"));

        let mac = normalizer.normalize_at(RawSample::Process(raw), PlatformTag::MacOs, now());
        assert!(mac.os_variant_fields.is_empty());
    }

    #[test]
    fn test_event_ids_are_unique() {
        let normalizer = Normalizer::for_platform("h", PlatformTag::Linux);
        let a = normalizer.normalize(RawSample::File(RawFile::default()));
        let b = normalizer.normalize(RawSample::File(RawFile::default()));
        assert_ne!(a.event_id, b.event_id);
    }

    fn arb_extras() -> impl Strategy<Value = Extras> {
        proptest::collection::btree_map(
            prop_oneof![
                Just("State".to_string()),
                Just("Inode".to_string()),
                Just("Status".to_string()),
                "[A-Za-z]{1,8}",
            ],
            prop_oneof![
                any::<i64>().prop_map(Value::from),
                ".{0,12}".prop_map(Value::from),
                Just(Value::Null),
            ],
            0..6,
        )
    }

    fn arb_raw() -> impl Strategy<Value = RawSample> {
        let process = (
            proptest::option::of(any::<i64>()),
            proptest::option::of(any::<f64>()),
            proptest::option::of(any::<i64>()),
            proptest::option::of(".{0,16}"),
            arb_extras(),
        )
            .prop_map(|(pid, cpu, mem, name, extras)| {
                RawSample::Process(RawProcess {
                    pid,
                    cpu_percent: cpu,
                    memory_bytes: mem,
                    name,
                    extras,
                    ..RawProcess::default()
                })
            });
        let network = (
            proptest::option::of(any::<i64>()),
            proptest::option::of(any::<i64>()),
            arb_extras(),
        )
            .prop_map(|(local, remote, extras)| {
                RawSample::Network(RawConnection {
                    local_port: local,
                    remote_port: remote,
                    extras,
                    ..RawConnection::default()
                })
            });
        let file = (
            proptest::option::of(".{0,24}"),
            proptest::option::of(any::<i64>()),
            arb_extras(),
        )
            .prop_map(|(path, size, extras)| {
                RawSample::File(RawFile {
                    path,
                    size,
                    extras,
                    ..RawFile::default()
                })
            });
        prop_oneof![process, network, file]
    }

    proptest! {
        #[test]
        fn prop_normalize_is_total(
            raw in arb_raw(),
            platform in prop_oneof![
                Just(PlatformTag::Linux),
                Just(PlatformTag::Windows),
                Just(PlatformTag::MacOs),
                Just(PlatformTag::Other),
            ],
        ) {
            let kind = raw.kind();
            let normalizer = Normalizer::for_platform("prop-host", platform);
            let event = normalizer.normalize_at(raw, platform, now());

            prop_assert_eq!(event.kind(), kind);
            prop_assert_eq!(event.os_type, platform);
            let mut expected: Vec<&str> = extension_table(platform, kind).iter().map(|(k, _)| *k).collect();
            expected.sort_unstable();
            let actual: Vec<&str> = event.os_variant_fields.keys().map(String::as_str).collect();
            prop_assert_eq!(actual, expected);

            if let EventFields::Process(p) = &event.fields {
                prop_assert!(p.cpu_percent.is_finite() && p.cpu_percent >= 0.0);
                prop_assert!(!p.name.is_empty());
            }

            // Serializable and readable back.
            let json = serde_json::to_string(&event).unwrap();
            let back: CanonicalEvent = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back.event_id, event.event_id);
        }
    }
}
