//! UAC audio streaming connection.

use crate::{
    desc::{Descriptors, Endpoint, Interface},
    Error, UsbClass,
};

/// Class-specific audio interface subtypes [UAC1 §4.5.2].
mod subtypes {
    pub const AS_GENERAL: u8 = 0x01;
    pub const FORMAT_TYPE: u8 = 0x02;
}

/// PCM wire formats supported by the streaming engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    /// 16-bit signed PCM (`wFormatTag` 0x0001).
    Pcm16,
    /// 32-bit IEEE float PCM (`wFormatTag` 0x0003).
    PcmFloat,
}

impl AudioFormat {
    fn from_format_tag(tag: u16) -> Option<Self> {
        match tag {
            0x0001 => Some(Self::Pcm16),
            0x0003 => Some(Self::PcmFloat),
            _ => None,
        }
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Pcm16 => write!(f, "PCM16"),
            Self::PcmFloat => write!(f, "PCM Float"),
        }
    }
}

/// Sample frequencies advertised by a `FORMAT_TYPE` descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleRates {
    /// Continuous range between minimum and maximum.
    Continuous {
        /// Lowest supported rate in Hz.
        min: u32,
        /// Highest supported rate in Hz.
        max: u32,
    },
    /// Discrete set of rates.
    Discrete(Vec<u32>),
}

impl SampleRates {
    /// The rate the streaming engine selects.
    ///
    /// For a continuous range this is the minimum; for discrete rates the
    /// first advertised entry.
    pub fn selected(&self) -> Option<u32> {
        match self {
            Self::Continuous { min, .. } => Some(*min),
            Self::Discrete(rates) => rates.first().copied(),
        }
    }
}

/// General audio streaming settings (`AS_GENERAL`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioStreamingGeneral {
    /// Terminal the interface is connected to.
    pub terminal_link: u8,
    /// Interface delay in frames.
    pub delay: u8,
    /// Audio data format tag.
    pub format_tag: u16,
}

/// Audio format type settings (`FORMAT_TYPE`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioStreamingFormatType {
    /// Format type code (1 for TYPE I PCM).
    pub format_type: u8,
    /// Number of channels.
    pub channels: u8,
    /// Bytes per sample per channel.
    pub sub_frame_size: u8,
    /// Effective bits per sample.
    pub bit_resolution: u8,
    /// Advertised sample frequencies.
    pub sample_rates: SampleRates,
}

/// The audio streaming capabilities extracted from a configuration blob.
///
/// Constructed by a single ordered walk of the descriptor stream; each
/// missing piece leaves the corresponding accessor empty and turns into a
/// typed failure reason for the state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioStreamingConnection {
    interface: Option<Interface>,
    general: Option<AudioStreamingGeneral>,
    format_type: Option<AudioStreamingFormatType>,
    endpoint: Option<Endpoint>,
}

impl AudioStreamingConnection {
    /// Walks the configuration blob once, capturing the first audio
    /// streaming interface, its `AS_GENERAL` and `FORMAT_TYPE` descriptors
    /// and the first IN endpoint that follows the interface.
    pub fn parse(descriptors: &Descriptors) -> Self {
        let mut conn = Self::default();

        for desc in descriptors {
            if conn.interface.is_none() {
                if let Some(iface) = desc.as_interface() {
                    if iface.interface_class == UsbClass::AUDIO
                        && iface.interface_sub_class == UsbClass::AUDIO_STREAMING
                        && iface.num_endpoints >= 1
                    {
                        conn.interface = Some(iface);
                    }
                }
                // class-specific records before the streaming interface
                // belong to other functions (e.g. the video input header
                // shares subtype codes with AS_GENERAL)
                continue;
            }

            if desc.is_class_specific_interface() {
                match desc.byte_at(2) {
                    subtypes::AS_GENERAL if conn.general.is_none() => {
                        conn.general = Some(AudioStreamingGeneral {
                            terminal_link: desc.byte_at(3),
                            delay: desc.byte_at(4),
                            format_tag: desc.word_at(5),
                        });
                    }
                    subtypes::FORMAT_TYPE if conn.format_type.is_none() => {
                        let sam_freq_type = desc.byte_at(7);
                        let sample_rates = if sam_freq_type == 0 {
                            SampleRates::Continuous {
                                min: desc.triplet_at(8),
                                max: desc.triplet_at(11),
                            }
                        } else {
                            SampleRates::Discrete(
                                (0..sam_freq_type as usize)
                                    .map(|i| desc.triplet_at(8 + 3 * i))
                                    .filter(|&rate| rate != 0)
                                    .collect(),
                            )
                        };
                        conn.format_type = Some(AudioStreamingFormatType {
                            format_type: desc.byte_at(3),
                            channels: desc.byte_at(4),
                            sub_frame_size: desc.byte_at(5),
                            bit_resolution: desc.byte_at(6),
                            sample_rates,
                        });
                    }
                    _ => {}
                }
            } else if conn.endpoint.is_none() && desc.is_endpoint_in() {
                conn.endpoint = desc.as_endpoint();
            }
        }

        conn
    }

    /// The matched audio streaming interface.
    pub fn interface(&self) -> Option<&Interface> {
        self.interface.as_ref()
    }

    /// The matched `AS_GENERAL` descriptor.
    pub fn general(&self) -> Option<&AudioStreamingGeneral> {
        self.general.as_ref()
    }

    /// The matched `FORMAT_TYPE` descriptor.
    pub fn format_type(&self) -> Option<&AudioStreamingFormatType> {
        self.format_type.as_ref()
    }

    /// The matched IN endpoint.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// Whether an IN endpoint was matched after the streaming interface.
    pub fn supports_audio_streaming(&self) -> bool {
        self.interface.is_some() && self.endpoint.is_some()
    }

    /// Whether a `FORMAT_TYPE` descriptor was matched.
    pub fn has_format_type(&self) -> bool {
        self.format_type.is_some()
    }

    /// Whether an `AS_GENERAL` descriptor was matched.
    pub fn has_general(&self) -> bool {
        self.general.is_some()
    }

    /// The PCM format advertised by the device, if supported.
    pub fn supported_audio_format(&self) -> Option<AudioFormat> {
        AudioFormat::from_format_tag(self.general.as_ref()?.format_tag)
    }

    /// The sample rate the streaming engine will use.
    pub fn sample_rate(&self) -> Option<u32> {
        self.format_type.as_ref()?.sample_rates.selected()
    }

    /// The first reason this connection cannot stream, if any.
    pub fn failure_reason(&self) -> Option<Error> {
        if self.interface.is_none() {
            Some(Error::NoAudioStreamingInterface)
        } else if self.endpoint.is_none() {
            Some(Error::NoAudioInputEndpoint)
        } else if self.general.is_none() || self.supported_audio_format().is_none() {
            Some(Error::UnsupportedAudioFormat)
        } else if self.sample_rate().is_none() {
            Some(Error::NoSampleRate)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn audio_blob(format_tag: u16, rates: &[u32]) -> Descriptors {
        let mut blob = Vec::new();
        // zero-bandwidth alternate, skipped by the interface predicate
        blob.extend_from_slice(&[9, 0x04, 3, 0, 0, 0x01, 0x02, 0, 0]);
        blob.extend_from_slice(&[9, 0x04, 3, 1, 1, 0x01, 0x02, 0, 0]);
        blob.extend_from_slice(&[7, 0x24, 0x01, 1, 1, format_tag as u8, (format_tag >> 8) as u8]);
        let mut ft = vec![0, 0x24, 0x02, 1, 2, 2, 16, rates.len() as u8];
        for rate in rates {
            ft.extend_from_slice(&rate.to_le_bytes()[..3]);
        }
        ft[0] = ft.len() as u8;
        blob.extend_from_slice(&ft);
        blob.extend_from_slice(&[9, 0x05, 0x84, 0x05, 0x00, 0x01, 1, 0, 0]);
        Descriptors::new(blob)
    }

    #[test]
    fn parses_pcm16_connection() {
        let conn = AudioStreamingConnection::parse(&audio_blob(0x0001, &[48_000, 44_100]));
        assert!(conn.supports_audio_streaming());
        assert!(conn.has_general());
        assert!(conn.has_format_type());
        assert_eq!(conn.supported_audio_format(), Some(AudioFormat::Pcm16));
        assert_eq!(conn.sample_rate(), Some(48_000));
        assert_eq!(conn.interface().unwrap().alternate_setting, 1);
        assert_eq!(conn.endpoint().unwrap().endpoint_address, 0x84);
        assert!(conn.failure_reason().is_none());
    }

    #[test]
    fn float_format_tag() {
        let conn = AudioStreamingConnection::parse(&audio_blob(0x0003, &[96_000]));
        assert_eq!(conn.supported_audio_format(), Some(AudioFormat::PcmFloat));
    }

    #[test]
    fn unsupported_format_tag() {
        let conn = AudioStreamingConnection::parse(&audio_blob(0x0002, &[48_000]));
        assert_eq!(conn.supported_audio_format(), None);
        assert!(matches!(conn.failure_reason(), Some(Error::UnsupportedAudioFormat)));
    }

    #[test]
    fn continuous_rate_selects_minimum() {
        let mut blob = Vec::new();
        blob.extend_from_slice(&[9, 0x04, 3, 1, 1, 0x01, 0x02, 0, 0]);
        blob.extend_from_slice(&[7, 0x24, 0x01, 1, 1, 0x01, 0x00]);
        let mut ft = vec![14, 0x24, 0x02, 1, 2, 2, 16, 0];
        ft.extend_from_slice(&8_000u32.to_le_bytes()[..3]);
        ft.extend_from_slice(&48_000u32.to_le_bytes()[..3]);
        blob.extend_from_slice(&ft);
        blob.extend_from_slice(&[9, 0x05, 0x84, 0x05, 0x00, 0x01, 1, 0, 0]);

        let conn = AudioStreamingConnection::parse(&Descriptors::new(blob));
        assert_eq!(
            conn.format_type().unwrap().sample_rates,
            SampleRates::Continuous { min: 8_000, max: 48_000 }
        );
        assert_eq!(conn.sample_rate(), Some(8_000));
    }

    #[test]
    fn missing_interface_reports_reason() {
        let conn = AudioStreamingConnection::parse(&Descriptors::new(vec![
            9, 0x04, 0, 0, 1, 0x0e, 0x02, 0, 0,
        ]));
        assert!(!conn.supports_audio_streaming());
        assert!(matches!(conn.failure_reason(), Some(Error::NoAudioStreamingInterface)));
    }

    #[test]
    fn video_input_header_not_mistaken_for_as_general() {
        let mut blob = Vec::new();
        // video streaming interface and its input header (subtype 0x01)
        blob.extend_from_slice(&[9, 0x04, 1, 0, 1, 0x0e, 0x02, 0, 0]);
        blob.extend_from_slice(&[14, 0x24, 0x01, 1, 0x00, 0x00, 0x81, 0, 0, 0, 0, 1, 0, 0]);
        let conn = AudioStreamingConnection::parse(&Descriptors::new(blob));
        assert!(!conn.has_general());
        assert!(!conn.supports_audio_streaming());
    }
}
