//! Audio post-processing.
//!
//! After a download lands at its final path a transfer may hand the file to a
//! [`PostProcessor`] to convert it to another audio format. The conversion
//! tool is opaque: the transfer only observes the output path or a failure.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::TransferError;
use crate::sink;

/// Target audio format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// MPEG-1 Layer III.
    Mp3,
    /// Ogg Vorbis.
    Ogg,
    /// Free Lossless Audio Codec.
    Flac,
    /// AAC in an MPEG-4 container.
    M4a,
}

impl AudioFormat {
    /// File extension for this format.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Ogg => "ogg",
            Self::Flac => "flac",
            Self::M4a => "m4a",
        }
    }

    const fn codec(self) -> &'static str {
        match self {
            Self::Mp3 => "libmp3lame",
            Self::Ogg => "libvorbis",
            Self::Flac => "flac",
            Self::M4a => "aac",
        }
    }

    const fn is_lossless(self) -> bool {
        matches!(self, Self::Flac)
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mp3 => write!(f, "MP3"),
            Self::Ogg => write!(f, "Ogg Vorbis"),
            Self::Flac => write!(f, "FLAC"),
            Self::M4a => write!(f, "M4A"),
        }
    }
}

impl std::str::FromStr for AudioFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp3" => Ok(Self::Mp3),
            "ogg" | "vorbis" => Ok(Self::Ogg),
            "flac" => Ok(Self::Flac),
            "m4a" | "aac" => Ok(Self::M4a),
            other => Err(format!("Unknown audio format: {other}")),
        }
    }
}

/// Encoding quality for lossy formats.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioQuality {
    /// Low quality (128 kbps).
    Low,
    /// Medium quality (192 kbps).
    #[default]
    Medium,
    /// High quality (320 kbps).
    High,
}

impl AudioQuality {
    /// Bitrate in kbps.
    #[must_use]
    pub const fn bitrate_kbps(self) -> u32 {
        match self {
            Self::Low => 128,
            Self::Medium => 192,
            Self::High => 320,
        }
    }
}

impl std::fmt::Display for AudioQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "Low (128 kbps)"),
            Self::Medium => write!(f, "Medium (192 kbps)"),
            Self::High => write!(f, "High (320 kbps)"),
        }
    }
}

/// Post-processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversionConfig {
    /// Format new transfers convert to, if any.
    #[serde(default)]
    pub format: Option<AudioFormat>,
    /// Encoding quality.
    #[serde(default)]
    pub quality: AudioQuality,
    /// Path or name of the `ffmpeg` executable.
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            format: None,
            quality: AudioQuality::default(),
            ffmpeg_path: default_ffmpeg_path(),
        }
    }
}

/// Converts a finished file to another format.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PostProcessor: Send + Sync {
    /// Convert `source` to `format`, returning the path of the new file.
    ///
    /// Implementations must leave `source` in place; the caller decides
    /// whether to delete it.
    async fn convert(
        &self,
        source: &Path,
        format: AudioFormat,
    ) -> std::result::Result<PathBuf, TransferError>;
}

/// [`PostProcessor`] that runs `ffmpeg`.
#[derive(Debug, Clone)]
pub struct FfmpegConverter {
    program: PathBuf,
    quality: AudioQuality,
}

impl FfmpegConverter {
    /// Create a converter from configuration.
    #[must_use]
    pub fn new(config: &ConversionConfig) -> Self {
        Self {
            program: config.ffmpeg_path.clone(),
            quality: config.quality,
        }
    }

    /// Claim a free path next to `source` for its `format` rendition by
    /// creating it empty. Existing files, `source` included, are never chosen.
    pub async fn reserve_output(
        source: &Path,
        format: AudioFormat,
    ) -> std::result::Result<PathBuf, TransferError> {
        let dir = source.parent().unwrap_or_else(|| Path::new(""));
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = format!("{stem}.{}", format.extension());
        loop {
            let candidate = sink::unique_destination(dir, &name).await;
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
                .await
            {
                Ok(_) => return Ok(candidate),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(TransferError::Conversion(format!(
                        "Failed to create {}: {e}",
                        candidate.display()
                    )));
                }
            }
        }
    }

    fn arguments(&self, source: &Path, output: &Path, format: AudioFormat) -> Vec<String> {
        let mut args = vec![
            "-nostdin".to_string(),
            // The output path is a placeholder this converter created.
            "-y".to_string(),
            "-i".to_string(),
            source.to_string_lossy().into_owned(),
            "-vn".to_string(),
            "-codec:a".to_string(),
            format.codec().to_string(),
        ];
        if !format.is_lossless() {
            args.push("-b:a".to_string());
            args.push(format!("{}k", self.quality.bitrate_kbps()));
        }
        args.push(output.to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl PostProcessor for FfmpegConverter {
    async fn convert(
        &self,
        source: &Path,
        format: AudioFormat,
    ) -> std::result::Result<PathBuf, TransferError> {
        let output = Reservation::new(Self::reserve_output(source, format).await?);
        let args = self.arguments(source, &output.path, format);
        debug!("Running {} {:?}", self.program.display(), args);

        let result = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        let failure = match result {
            Err(e) => Some(format!("Failed to run {}: {e}", self.program.display())),
            Ok(result) if !result.status.success() => {
                let stderr = String::from_utf8_lossy(&result.stderr);
                let detail = stderr.lines().last().unwrap_or("no output").trim();
                Some(format!(
                    "{} exited with {}: {detail}",
                    self.program.display(),
                    result.status
                ))
            }
            Ok(_) => None,
        };

        if let Some(message) = failure {
            warn!("Conversion of {} failed: {}", source.display(), message);
            return Err(TransferError::Conversion(message));
        }

        let output = output.keep();
        info!("Converted {} to {}", source.display(), output.display());
        Ok(output)
    }
}

/// Output file owned by a conversion in progress. Deleted on drop unless
/// kept, so failed or abandoned runs leave nothing behind.
struct Reservation {
    path: PathBuf,
    kept: bool,
}

impl Reservation {
    const fn new(path: PathBuf) -> Self {
        Self { path, kept: false }
    }

    fn keep(mut self) -> PathBuf {
        self.kept = true;
        std::mem::take(&mut self.path)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!("Failed to remove {}: {}", self.path.display(), e);
        }
    }
}
