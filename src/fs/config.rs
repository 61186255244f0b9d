// src/fs/config.rs

//! File system configuration
//!
//! Built once, validated, then immutable. Validation failures are EINVAL.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Open flags understood by the facade
pub mod flags {
    pub const O_RDONLY: u32 = 0o0;
    pub const O_WRONLY: u32 = 0o1;
    pub const O_RDWR: u32 = 0o2;
    pub const O_CREAT: u32 = 0o100;
    pub const O_EXCL: u32 = 0o200;
    pub const O_TRUNC: u32 = 0o1000;
    pub const O_APPEND: u32 = 0o2000;
}

/// Highest mode expressible in four octal digits
pub const MODE_MASK: u32 = 0o7777;

/// Default file mode
pub const DEFAULT_MODE: u32 = 0o666;

/// Default directory mode
pub const DEFAULT_DIR_MODE: u32 = 0o777;

/// Text encodings accepted for write payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Utf8,
    Ascii,
    Base64,
    Hex,
    Binary,
    Latin1,
}

impl Encoding {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Utf8 => "utf8",
            Self::Ascii => "ascii",
            Self::Base64 => "base64",
            Self::Hex => "hex",
            Self::Binary => "binary",
            Self::Latin1 => "latin1",
        }
    }

    /// Parse an encoding name; both utf8 spellings are accepted
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Self::Utf8),
            "ascii" => Ok(Self::Ascii),
            "base64" => Ok(Self::Base64),
            "hex" => Ok(Self::Hex),
            "binary" => Ok(Self::Binary),
            "latin1" => Ok(Self::Latin1),
            other => Err(Error::invalid(format!("unknown encoding: {other}"))),
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Immutable file system configuration
#[derive(Debug, Clone)]
pub struct FsConfig {
    root_path: String,
    read_only: bool,
    encoding: Encoding,
    mode: u32,
    flags: u32,
    recursive: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            root_path: "/".to_string(),
            read_only: false,
            encoding: Encoding::Utf8,
            mode: DEFAULT_MODE,
            flags: flags::O_RDONLY,
            recursive: false,
        }
    }
}

impl FsConfig {
    pub fn builder() -> FsConfigBuilder {
        FsConfigBuilder::default()
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn recursive(&self) -> bool {
        self.recursive
    }
}

/// Builder validating each field before producing an [`FsConfig`]
#[derive(Debug, Clone, Default)]
pub struct FsConfigBuilder {
    root_path: Option<String>,
    read_only: Option<bool>,
    encoding: Option<Encoding>,
    mode: Option<u32>,
    flags: Option<u32>,
    recursive: Option<bool>,
}

impl FsConfigBuilder {
    pub fn root_path(mut self, root_path: impl Into<String>) -> Self {
        self.root_path = Some(root_path.into());
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    /// Parse and set the encoding by name
    pub fn encoding_name(mut self, name: &str) -> Result<Self> {
        self.encoding = Some(Encoding::parse(name)?);
        Ok(self)
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = Some(recursive);
        self
    }

    pub fn build(self) -> Result<FsConfig> {
        let defaults = FsConfig::default();

        let root_path = self.root_path.unwrap_or(defaults.root_path);
        if !root_path.starts_with('/') {
            return Err(Error::invalid(format!(
                "root_path must be absolute, got {root_path:?}"
            )));
        }

        let mode = self.mode.unwrap_or(defaults.mode);
        if mode > MODE_MASK {
            return Err(Error::invalid(format!(
                "mode {mode:o} exceeds {MODE_MASK:o}"
            )));
        }

        Ok(FsConfig {
            root_path,
            read_only: self.read_only.unwrap_or(defaults.read_only),
            encoding: self.encoding.unwrap_or(defaults.encoding),
            mode,
            flags: self.flags.unwrap_or(defaults.flags),
            recursive: self.recursive.unwrap_or(defaults.recursive),
        })
    }
}
