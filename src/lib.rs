//! A Rust library for downloading the media content of a Microsoft Smooth Streaming presentation,
//! as used by on-demand video services built on IIS Media Services. The library parses the client
//! manifest (the `.ismc` file, an XML document) into Rust structs, selects the highest-bitrate
//! video and audio quality levels, and downloads every fragment of each track over HTTP.
//!
//! [Smooth Streaming](https://en.wikipedia.org/wiki/Adaptive_bitrate_streaming#Microsoft_Smooth_Streaming_(MSS))
//! describes a presentation with two files published next to each other on the origin server:
//!
//! - the server manifest (`.ism`), a SMIL document naming the media files on the server, and
//! - the client manifest (`.ismc`), which lists for each `StreamIndex` (video, audio, text) the
//!   available `QualityLevel` renditions and a timeline of `c` (chunk) elements giving the duration
//!   of each fragment.
//!
//! Each fragment is requested with a URL of the form
//! `{base}{name}.ism/QualityLevels({bitrate})/Fragments({type}={start time})`, where the start time
//! is the sum of the durations of the preceding chunks.
//!
//! The downloaded fragments of each track are kept individually (`video/fragment_0.ismv`, ...) and
//! are also concatenated into a single file per track. Muxing is left to the user: the downloader
//! returns an MP4Box command line (see [`mp4box::Mp4BoxCommand`]) that is printed, never run.
//!
//!
//! ## Limitations / unsupported features
//!
//! - Live presentations (`IsLive="TRUE"`)
//! - Encrypted content (the `Protection` element is ignored)
//! - Text streams and alternate audio languages: the first `StreamIndex` of each type is used
//! - Chunk repeat counts (`r`) and explicit start times (`t`) are not used to compute positions
//
// Reference: [MS-SSTR] Smooth Streaming Protocol,
//   https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-sstr/


#[cfg(feature = "fetch")]
pub mod fetch;
pub mod mp4box;

use std::fmt;
use std::str::FromStr;
use serde::{Serialize, Deserialize};
use serde_with::skip_serializing_none;


#[derive(thiserror::Error, Debug)]
pub enum SmoothError {
    #[error("parse error {0}")]
    Parsing(String),
    #[error("I/O error {1}")]
    Io(#[source] std::io::Error, String),
    #[error("network error {0}")]
    Network(String),
    #[error("Could not find {0} stream.")]
    MissingStream(Track),
    #[error("Could not find {0} quality nodes.")]
    MissingQualityLevels(Track),
    #[error("Could not fetch {0} timing nodes.")]
    MissingTimeline(Track),
    #[error("Invalid download type.")]
    InvalidTrack(String),
}

impl SmoothError {
    /// Returns `true` for the problems that are reported to the user and stop the run cleanly (a
    /// manifest lacking some expected content), as opposed to network, parsing and filesystem
    /// failures.
    pub fn is_reported_abort(&self) -> bool {
        matches!(self,
                 SmoothError::MissingStream(_) |
                 SmoothError::MissingQualityLevels(_) |
                 SmoothError::MissingTimeline(_) |
                 SmoothError::InvalidTrack(_))
    }
}


/// The two media types that are downloaded from a presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Track {
    Video,
    Audio,
}

impl Track {
    /// Tracks in download order.
    pub const ALL: [Track; 2] = [Track::Video, Track::Audio];

    /// The `StreamIndex@Type` value, which is also the output directory name and the key used in
    /// fragment requests.
    pub fn name(&self) -> &'static str {
        match self {
            Track::Video => "video",
            Track::Audio => "audio",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Track::Video => "ismv",
            Track::Audio => "isma",
        }
    }

    /// Local filename of the fragment at (zero-based) `index` in the track's timeline.
    pub fn fragment_name(&self, index: usize) -> String {
        format!("fragment_{index}.{}", self.extension())
    }

    /// Filename of the file holding all fragments of the track concatenated in order.
    pub fn appended_name(&self) -> String {
        format!("{}_appended", self.name())
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Track {
    type Err = SmoothError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(Track::Video),
            "audio" => Ok(Track::Audio),
            _ => Err(SmoothError::InvalidTrack(s.to_string())),
        }
    }
}


// Integer attributes in the client manifest are parsed leniently: surrounding whitespace is
// accepted, and anything else that isn't a non-negative integer is treated as absent.
fn parse_integer(s: &str) -> Option<u64> {
    s.trim().parse::<u64>().ok()
}


// We are using the quick_xml + serde crates to deserialize the client manifest to Rust structs.
// Attributes are kept as strings, because an attribute that fails to parse as an integer must cause
// the element to be skipped rather than the whole manifest to be rejected. Serde ignores unknown
// elements (such as Protection and CustomAttributes), so we only model what we use plus some
// attributes that are useful for diagnostics.

/// A `c` element of a stream's timeline, describing one fragment.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkTiming {
    /// Fragment number
    #[serde(rename = "@n")]
    pub n: Option<String>,
    /// Fragment duration, in the stream's timescale units
    #[serde(rename = "@d")]
    pub d: Option<String>,
    /// Explicit start time
    #[serde(rename = "@t")]
    pub t: Option<String>,
}

impl ChunkTiming {
    pub fn duration(&self) -> Option<u64> {
        self.d.as_deref().and_then(parse_integer)
    }
}

/// One encoded rendition of a stream.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct QualityLevel {
    #[serde(rename = "@Index")]
    pub index: Option<String>,
    /// Bits per second
    #[serde(rename = "@Bitrate")]
    pub bitrate: Option<String>,
    #[serde(rename = "@FourCC")]
    pub fourcc: Option<String>,
    #[serde(rename = "@MaxWidth")]
    pub max_width: Option<String>,
    #[serde(rename = "@MaxHeight")]
    pub max_height: Option<String>,
    #[serde(rename = "@SamplingRate")]
    pub sampling_rate: Option<String>,
    #[serde(rename = "@Channels")]
    pub channels: Option<String>,
    #[serde(rename = "@CodecPrivateData")]
    pub codec_private_data: Option<String>,
}

impl QualityLevel {
    pub fn bitrate(&self) -> Option<u64> {
        self.bitrate.as_deref().and_then(parse_integer)
    }
}

/// All quality levels and the fragment timeline for one media type.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct StreamIndex {
    /// "video", "audio" or "text"
    #[serde(rename = "@Type")]
    pub stream_type: Option<String>,
    #[serde(rename = "@Name")]
    pub name: Option<String>,
    #[serde(rename = "@Chunks")]
    pub chunks: Option<String>,
    #[serde(rename = "@QualityLevels")]
    pub quality_level_count: Option<String>,
    /// URL template for fragment requests, for example "QualityLevels({bitrate})/Fragments(video={start time})"
    #[serde(rename = "@Url")]
    pub url: Option<String>,
    #[serde(rename = "@TimeScale")]
    pub timescale: Option<String>,
    #[serde(rename = "@Language")]
    pub language: Option<String>,
    #[serde(rename = "@MaxWidth")]
    pub max_width: Option<String>,
    #[serde(rename = "@MaxHeight")]
    pub max_height: Option<String>,
    #[serde(rename = "QualityLevel")]
    pub quality_levels: Vec<QualityLevel>,
    #[serde(rename = "c")]
    pub timeline: Vec<ChunkTiming>,
}

impl StreamIndex {
    /// Returns `true` if this StreamIndex has the `Type` attribute of `track`.
    pub fn is_track(&self, track: Track) -> bool {
        self.stream_type.as_deref() == Some(track.name())
    }

    /// The QualityLevel with the largest parsable `Bitrate`, together with that bitrate. When
    /// several QualityLevels share the maximal bitrate, the first one listed wins. QualityLevels
    /// whose `Bitrate` is missing or is not an integer are ignored. Returns `None` if no QualityLevel
    /// has a usable bitrate.
    pub fn highest_quality_level(&self) -> Option<(&QualityLevel, u64)> {
        self.quality_levels.iter()
            .filter_map(|ql| ql.bitrate().map(|b| (ql, b)))
            .reduce(|best, candidate| if candidate.1 > best.1 { candidate } else { best })
    }

    pub fn highest_bitrate(&self) -> Option<u64> {
        self.highest_quality_level().map(|(_, b)| b)
    }

    /// The start position of each fragment in the timeline, in timescale units. The first fragment
    /// starts at 0 and each following one at the running sum of the preceding durations. A `c`
    /// element whose duration is missing or unparsable contributes no position and does not advance
    /// the running sum, so the result can be shorter than the timeline. Returns `None` if the
    /// timeline is empty.
    pub fn fragment_positions(&self) -> Option<Vec<u64>> {
        if self.timeline.is_empty() {
            return None;
        }
        let mut position: u64 = 0;
        let positions = self.timeline.iter()
            .filter_map(ChunkTiming::duration)
            .map(|d| {
                let start = position;
                position = position.saturating_add(d);
                start
            })
            .collect();
        Some(positions)
    }
}

/// The root node of a parsed Smooth Streaming client manifest.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SmoothStreamingMedia {
    #[serde(rename = "@MajorVersion")]
    pub major_version: Option<String>,
    #[serde(rename = "@MinorVersion")]
    pub minor_version: Option<String>,
    #[serde(rename = "@TimeScale")]
    pub timescale: Option<String>,
    /// Total presentation duration, in timescale units
    #[serde(rename = "@Duration")]
    pub duration: Option<String>,
    #[serde(rename = "@IsLive")]
    pub is_live: Option<String>,
    #[serde(rename = "StreamIndex")]
    pub stream_indexes: Vec<StreamIndex>,
}

impl SmoothStreamingMedia {
    /// The first StreamIndex of the type of `track`.
    pub fn stream_index(&self, track: Track) -> Option<&StreamIndex> {
        self.stream_indexes.iter().find(|si| si.is_track(track))
    }
}

impl fmt::Display for SmoothStreamingMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let xml = quick_xml::se::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&xml)
    }
}


/// Parse a Smooth Streaming client manifest, provided as an XML string.
///
/// `StreamIndex` elements are collected from anywhere in the document, in document order, and not
/// only from the children of the root element.
pub fn parse(xml: &str) -> Result<SmoothStreamingMedia, SmoothError> {
    let ssm: Result<SmoothStreamingMedia, quick_xml::DeError> = quick_xml::de::from_str(xml);
    match ssm {
        Ok(mut ssm) => {
            ssm.stream_indexes = descendant_stream_indexes(xml)?;
            Ok(ssm)
        },
        Err(e) => Err(SmoothError::Parsing(e.to_string())),
    }
}

// Scan the document for StreamIndex start tags at any depth and deserialize the subtree of each.
// A StreamIndex nested inside another is part of the outer one's subtree and isn't returned.
fn descendant_stream_indexes(xml: &str) -> Result<Vec<StreamIndex>, SmoothError> {
    use quick_xml::events::Event;
    use quick_xml::reader::Reader;

    let mut reader = Reader::from_str(xml);
    let mut found = Vec::new();
    loop {
        let start = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"StreamIndex" => {
                let end = e.to_end().into_owned();
                reader.read_to_end(end.name())
                    .map_err(|e| SmoothError::Parsing(e.to_string()))?;
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"StreamIndex" => (),
            Ok(Event::Eof) => break,
            Ok(_) => continue,
            Err(e) => return Err(SmoothError::Parsing(e.to_string())),
        }
        let subtree = &xml[start..reader.buffer_position() as usize];
        let si: StreamIndex = quick_xml::de::from_str(subtree)
            .map_err(|e| SmoothError::Parsing(e.to_string()))?;
        found.push(si);
    }
    Ok(found)
}


/// What will be downloaded for one track: the selected bitrate and the position of each fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackPlan {
    pub track: Track,
    pub bitrate: u64,
    pub positions: Vec<u64>,
}

/// Select the video and audio streams of the manifest, their highest bitrate and their fragment
/// positions, in download order (video then audio). Fails with one of the errors for which
/// [`SmoothError::is_reported_abort`] holds if the manifest lacks a stream, a usable quality level
/// or a timeline.
pub fn plan_tracks(manifest: &SmoothStreamingMedia) -> Result<Vec<TrackPlan>, SmoothError> {
    let mut streams = Vec::with_capacity(Track::ALL.len());
    for track in Track::ALL {
        let si = manifest.stream_index(track)
            .ok_or(SmoothError::MissingStream(track))?;
        streams.push((track, si));
    }
    let mut bitrates = Vec::with_capacity(streams.len());
    for (track, si) in &streams {
        let bitrate = si.highest_bitrate()
            .ok_or(SmoothError::MissingQualityLevels(*track))?;
        bitrates.push(bitrate);
    }
    let mut plans = Vec::with_capacity(streams.len());
    for ((track, si), bitrate) in streams.into_iter().zip(bitrates) {
        let positions = si.fragment_positions()
            .ok_or(SmoothError::MissingTimeline(track))?;
        plans.push(TrackPlan { track, bitrate, positions });
    }
    Ok(plans)
}
