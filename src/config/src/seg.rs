// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};

use std::io::Read;
use std::path::{Path, PathBuf};

// constants to define default values
const HEAP_SIZE: usize = 64 * 1024 * 1024;
const SEGMENT_SIZE: i32 = 1024 * 1024;
const HASH_POWER: u8 = 16;
const OVERFLOW_FACTOR: f64 = 1.0;
const MERGE_MAX: usize = 8;
const MERGE_TARGET: usize = 4;
const RESERVED_SEGMENTS: usize = 0;
const DATAPOOL_PATH: Option<String> = None;
const DATAPOOL_PREFAULT: bool = false;

// helper functions
fn heap_size() -> usize {
    HEAP_SIZE
}

fn segment_size() -> i32 {
    SEGMENT_SIZE
}

fn hash_power() -> u8 {
    HASH_POWER
}

fn overflow_factor() -> f64 {
    OVERFLOW_FACTOR
}

fn merge_max() -> usize {
    MERGE_MAX
}

fn merge_target() -> usize {
    MERGE_TARGET
}

fn reserved_segments() -> usize {
    RESERVED_SEGMENTS
}

fn datapool_path() -> Option<String> {
    DATAPOOL_PATH
}

fn datapool_prefault() -> bool {
    DATAPOOL_PREFAULT
}

/// How space is reclaimed once the free pool is empty.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Eviction {
    None,
    #[default]
    Random,
    Fifo,
    Cte,
    Util,
    Merge,
}

// definitions
#[derive(Serialize, Deserialize, Debug)]
pub struct Seg {
    #[serde(default = "heap_size")]
    heap_size: usize,
    #[serde(default = "segment_size")]
    segment_size: i32,
    #[serde(default = "hash_power")]
    hash_power: u8,
    #[serde(default = "overflow_factor")]
    overflow_factor: f64,
    #[serde(default)]
    eviction: Eviction,
    #[serde(default = "merge_max")]
    merge_max: usize,
    #[serde(default = "merge_target")]
    merge_target: usize,
    #[serde(default = "reserved_segments")]
    reserved_segments: usize,
    #[serde(default = "datapool_path")]
    datapool_path: Option<String>,
    #[serde(default = "datapool_prefault")]
    datapool_prefault: bool,
}

impl Default for Seg {
    fn default() -> Self {
        Self {
            heap_size: heap_size(),
            segment_size: segment_size(),
            hash_power: hash_power(),
            overflow_factor: overflow_factor(),
            eviction: Eviction::default(),
            merge_max: merge_max(),
            merge_target: merge_target(),
            reserved_segments: reserved_segments(),
            datapool_path: datapool_path(),
            datapool_prefault: datapool_prefault(),
        }
    }
}

// implementation
impl Seg {
    /// Load the `[seg]` section from a TOML file. Missing keys take their
    /// defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let mut file = std::fs::File::open(path)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        Self::parse(&content)
    }

    /// Parse TOML text which either holds a `[seg]` table or the bare keys.
    pub fn parse(content: &str) -> Result<Self, std::io::Error> {
        let mut table: toml::Table = toml::from_str(content).map_err(|e| {
            error!("{}", e);
            std::io::Error::new(std::io::ErrorKind::Other, "Error parsing config")
        })?;

        let section = match table.remove("seg") {
            Some(section) => section,
            None => toml::Value::Table(table),
        };

        section.try_into().map_err(|e| {
            error!("{}", e);
            std::io::Error::new(std::io::ErrorKind::Other, "Error parsing config")
        })
    }

    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    pub fn segment_size(&self) -> i32 {
        self.segment_size
    }

    pub fn hash_power(&self) -> u8 {
        self.hash_power
    }

    pub fn overflow_factor(&self) -> f64 {
        self.overflow_factor
    }

    pub fn eviction(&self) -> Eviction {
        self.eviction
    }

    /// Most segments claimed by a single merge.
    pub fn merge_max(&self) -> usize {
        self.merge_max
    }

    /// Number of segments a merge aims to combine into one.
    pub fn merge_target(&self) -> usize {
        self.merge_target
    }

    pub fn reserved_segments(&self) -> usize {
        self.reserved_segments
    }

    pub fn datapool_path(&self) -> Option<PathBuf> {
        self.datapool_path.as_ref().map(PathBuf::from)
    }

    pub fn datapool_prefault(&self) -> bool {
        self.datapool_prefault
    }
}

// trait definitions
pub trait SegConfig {
    fn seg(&self) -> &Seg;
}

impl SegConfig for Seg {
    fn seg(&self) -> &Seg {
        self
    }
}
