use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::str::FromStr;

use log::debug;

use crate::error::GpioError;

pub(crate) const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// Direction of a GPIO line, using the kernel's attribute vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("in"),
            Direction::Output => f.write_str("out"),
        }
    }
}

impl FromStr for Direction {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "in" => Ok(Direction::Input),
            "out" | "high" | "low" => Ok(Direction::Output),
            other => Err(GpioError::InvalidConfigurationValue(format!(
                "unknown direction {other:?}"
            ))),
        }
    }
}

/// Edge mode of an input line, using the kernel's attribute vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Edge {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::None => f.write_str("none"),
            Edge::Rising => f.write_str("rising"),
            Edge::Falling => f.write_str("falling"),
            Edge::Both => f.write_str("both"),
        }
    }
}

impl FromStr for Edge {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "none" => Ok(Edge::None),
            "rising" => Ok(Edge::Rising),
            "falling" => Ok(Edge::Falling),
            "both" => Ok(Edge::Both),
            other => Err(GpioError::InvalidConfigurationValue(format!(
                "unknown edge mode {other:?}"
            ))),
        }
    }
}

/// Read/write access to the per-line control files under one sysfs GPIO root.
#[derive(Debug, Clone)]
pub(crate) struct AttributeStore {
    root: PathBuf,
}

impl AttributeStore {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn pin_dir(&self, number: u32) -> PathBuf {
        self.root.join(format!("gpio{number}"))
    }

    fn attr_path(&self, number: u32, name: &str) -> PathBuf {
        self.pin_dir(number).join(name)
    }

    pub(crate) fn is_exported(&self, number: u32) -> bool {
        self.pin_dir(number).is_dir()
    }

    pub(crate) fn has_direction(&self, number: u32) -> bool {
        self.attr_path(number, "direction").is_file()
    }

    pub(crate) fn has_edge(&self, number: u32) -> bool {
        self.attr_path(number, "edge").is_file()
    }

    pub(crate) fn export(&self, number: u32) -> Result<(), GpioError> {
        if self.is_exported(number) {
            debug!("pin {number} already exported");
            return Ok(());
        }
        write_attr(self.root.join("export"), &number.to_string())
    }

    pub(crate) fn unexport(&self, number: u32) -> Result<(), GpioError> {
        write_attr(self.root.join("unexport"), &number.to_string())
    }

    pub(crate) fn write_direction(
        &self,
        number: u32,
        direction: Direction,
        initial: Option<bool>,
    ) -> Result<(), GpioError> {
        let payload = match (direction, initial) {
            (Direction::Input, _) => "in",
            (Direction::Output, None) => "out",
            (Direction::Output, Some(true)) => "high",
            (Direction::Output, Some(false)) => "low",
        };
        write_attr(self.attr_path(number, "direction"), payload)
    }

    pub(crate) fn write_edge(&self, number: u32, edge: Edge) -> Result<(), GpioError> {
        write_attr(self.attr_path(number, "edge"), &edge.to_string())
    }

    pub(crate) fn write_active_low(&self, number: u32, inverted: bool) -> Result<(), GpioError> {
        write_attr(self.attr_path(number, "active_low"), level_payload(inverted))
    }

    pub(crate) fn open_value(&self, number: u32) -> Result<File, GpioError> {
        let path = self.value_path(number);
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| GpioError::Io { path, source })
    }

    pub(crate) fn value_path(&self, number: u32) -> PathBuf {
        self.attr_path(number, "value")
    }
}

pub(crate) fn level_payload(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

pub(crate) fn parse_level(raw: &str) -> Result<bool, GpioError> {
    match raw.trim() {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(GpioError::InvalidConfigurationValue(format!(
            "unexpected level {other:?} in value attribute"
        ))),
    }
}

fn write_attr(path: PathBuf, payload: &str) -> Result<(), GpioError> {
    fs::write(&path, payload).map_err(|source| GpioError::Io { path, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_store() -> (tempfile::TempDir, AttributeStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AttributeStore::new(dir.path().to_path_buf());
        (dir, store)
    }

    fn seed_pin(dir: &tempfile::TempDir, number: u32, with_edge: bool) {
        let pin_dir = dir.path().join(format!("gpio{number}"));
        fs::create_dir_all(&pin_dir).expect("pin dir");
        fs::write(pin_dir.join("direction"), "in").expect("direction");
        fs::write(pin_dir.join("value"), "0").expect("value");
        fs::write(pin_dir.join("active_low"), "0").expect("active_low");
        if with_edge {
            fs::write(pin_dir.join("edge"), "none").expect("edge");
        }
    }

    #[test]
    fn direction_vocabulary_round_trips() {
        assert_eq!(Direction::Input.to_string(), "in");
        assert_eq!(Direction::Output.to_string(), "out");
        assert_eq!("in".parse::<Direction>().unwrap(), Direction::Input);
        assert_eq!("out\n".parse::<Direction>().unwrap(), Direction::Output);
        assert_eq!("high".parse::<Direction>().unwrap(), Direction::Output);
        assert!(matches!(
            "sideways".parse::<Direction>(),
            Err(GpioError::InvalidConfigurationValue(_))
        ));
    }

    #[test]
    fn edge_vocabulary_round_trips() {
        for edge in [Edge::None, Edge::Rising, Edge::Falling, Edge::Both] {
            assert_eq!(edge.to_string().parse::<Edge>().unwrap(), edge);
        }
        assert!(matches!(
            "sometimes".parse::<Edge>(),
            Err(GpioError::InvalidConfigurationValue(_))
        ));
    }

    #[test]
    fn export_writes_decimal_number() {
        let (dir, store) = scratch_store();
        store.export(21).unwrap();
        let written = fs::read_to_string(dir.path().join("export")).unwrap();
        assert_eq!(written, "21");
    }

    #[test]
    fn export_skips_already_exported_pin() {
        let (dir, store) = scratch_store();
        seed_pin(&dir, 21, true);
        // no export control file exists, so a write attempt would fail loudly
        store.export(21).unwrap();
        assert!(!dir.path().join("export").exists());
    }

    #[test]
    fn unexport_writes_decimal_number() {
        let (dir, store) = scratch_store();
        store.unexport(7).unwrap();
        let written = fs::read_to_string(dir.path().join("unexport")).unwrap();
        assert_eq!(written, "7");
    }

    #[test]
    fn direction_payload_covers_initial_value_forms() {
        let (dir, store) = scratch_store();
        seed_pin(&dir, 4, false);
        let path = dir.path().join("gpio4/direction");

        store.write_direction(4, Direction::Input, None).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "in");
        store.write_direction(4, Direction::Output, None).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "out");
        store
            .write_direction(4, Direction::Output, Some(true))
            .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "high");
        store
            .write_direction(4, Direction::Output, Some(false))
            .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "low");
    }

    #[test]
    fn attribute_probes_reflect_tree_shape() {
        let (dir, store) = scratch_store();
        assert!(!store.is_exported(9));
        seed_pin(&dir, 9, false);
        assert!(store.is_exported(9));
        assert!(store.has_direction(9));
        assert!(!store.has_edge(9));
        seed_pin(&dir, 10, true);
        assert!(store.has_edge(10));
    }

    #[test]
    fn level_vocabulary_round_trips() {
        assert_eq!(level_payload(true), "1");
        assert_eq!(level_payload(false), "0");
        assert!(parse_level("1\n").unwrap());
        assert!(!parse_level("0").unwrap());
        assert!(matches!(
            parse_level("2"),
            Err(GpioError::InvalidConfigurationValue(_))
        ));
    }

    #[test]
    fn missing_attribute_write_reports_path() {
        let (dir, store) = scratch_store();
        // gpio3 was never exported, so its attribute directory is absent
        let err = store.write_edge(3, Edge::Rising).unwrap_err();
        match err {
            GpioError::Io { path, .. } => {
                assert!(path.starts_with(dir.path()));
                assert!(path.ends_with("gpio3/edge"));
            }
            other => panic!("expected io error, got {other:?}"),
        }
    }
}
