//! Encoder builder: the single coupling point between protocol negotiation
//! and the audio format actually produced.

use std::str::FromStr;

use crate::encoder::{Encoder, EncoderError, FlacEncoder, WaveEncoder};
use crate::util::writer::AsyncWriter;

/// Streaming formats the server can produce. The inventory is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Pcm,
    Flac,
}

impl FromStr for Format {
    type Err = EncoderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pcm" | "wave" | "wav" => Ok(Self::Pcm),
            "flac" => Ok(Self::Flac),
            _ => Err(EncoderError::Init(format!("unknown format: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EncoderBuilder {
    format: Option<Format>,
    mime: Option<String>,
    extension: Option<String>,
    header: Option<bool>,
}

impl EncoderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pre-populated with the recognised options for `format`.
    pub fn for_format(format: Format) -> Self {
        match format {
            Format::Pcm => Self::new()
                .format(Format::Pcm)
                .mime("audio/x-wave")
                .extension("wav")
                .header(true),
            Format::Flac => Self::new()
                .format(Format::Flac)
                .mime("audio/flac")
                .extension("flac")
                .header(false),
        }
    }

    pub fn format(mut self, format: Format) -> Self {
        self.format = Some(format);
        self
    }

    pub fn mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    pub fn header(mut self, header: bool) -> Self {
        self.header = Some(header);
        self
    }

    pub fn get_format(&self) -> Result<Format, EncoderError> {
        self.format.ok_or(EncoderError::Builder("format"))
    }

    pub fn get_mime(&self) -> Result<&str, EncoderError> {
        self.mime.as_deref().ok_or(EncoderError::Builder("mime"))
    }

    pub fn get_extension(&self) -> Result<&str, EncoderError> {
        self.extension
            .as_deref()
            .ok_or(EncoderError::Builder("extension"))
    }

    pub fn get_header(&self) -> Result<bool, EncoderError> {
        self.header.ok_or(EncoderError::Builder("header"))
    }

    /// Build an encoder for the negotiated stream parameters. Fails when a
    /// required option was never provided.
    pub fn build(
        &self,
        channels: u16,
        sampling_rate: u32,
        bits_per_sample: u16,
        bits_per_value: u16,
        writer: Box<dyn AsyncWriter>,
    ) -> Result<Encoder, EncoderError> {
        // All options must be present even where a variant does not consume
        // them; a partially-configured builder is a wiring bug.
        let format = self.get_format()?;
        self.get_mime()?;
        self.get_extension()?;
        self.get_header()?;

        match format {
            Format::Pcm => Ok(Encoder::Wave(WaveEncoder::new(
                channels,
                sampling_rate,
                bits_per_sample,
                bits_per_value,
                writer,
            ))),
            Format::Flac => Ok(Encoder::Flac(FlacEncoder::new(
                channels,
                sampling_rate,
                bits_per_sample,
                bits_per_value,
                writer,
            )?)),
        }
    }
}
