//! Support for downloading content from Smooth Streaming presentations.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use futures_util::StreamExt;
use tokio::fs;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info};
use url::Url;
use crate::{parse, plan_tracks, SmoothError, Track, TrackPlan};
use crate::mp4box::{Mp4BoxCommand, MuxInputs};

/// A `Client` from the `reqwest` crate, that we use to download content over HTTP.
pub type HttpClient = reqwest::Client;

/// Location of the presentation downloaded when no other is specified.
pub const DEFAULT_BASE_URL: &str = "http://videos.halowaypoint.com/videos1/db6723e6038f41a1819e8e71be7776a0/";
pub const DEFAULT_MANIFEST_NAME: &str = "2060770-3";


/// Receives updates concerning the progression of the download, and can display this information to
/// the user, for example using a progress bar.
pub trait ProgressObserver: Send + Sync {
    fn update(&self, percent: u32, message: &str);
}


/// The SmoothDownloader fetches the manifests of a Smooth Streaming presentation, selects the
/// highest-bitrate video and audio quality levels, and downloads every fragment of both tracks to
/// the output directory. Fragments that are already present on disk are reused without being
/// checked, so an interrupted download can be resumed by running it again.
///
/// Example
/// ```rust,no_run
/// use smoothstream_dl::fetch::SmoothDownloader;
///
/// # async fn run() -> Result<(), smoothstream_dl::SmoothError> {
/// let download = SmoothDownloader::new("http://example.com/videos/", "asset-1")
///     .output_dir("/tmp/asset-1")
///     .download()
///     .await?;
/// println!("{}", download.mux_command);
/// # Ok(())
/// # }
/// ```
pub struct SmoothDownloader {
    /// URL of the directory containing the manifests, including the trailing slash.
    pub base_url: String,
    /// Basename of the `.ism` and `.ismc` manifests.
    pub manifest_name: String,
    output_dir: PathBuf,
    http_client: Option<HttpClient>,
    verbosity: u8,
    mux_inputs: MuxInputs,
    mux_output: String,
    progress_observers: Vec<Arc<dyn ProgressObserver>>,
    pub mp4box_location: String,
}

/// The result of downloading one track.
#[derive(Debug, Clone)]
pub struct TrackDownload {
    pub track: Track,
    pub bitrate: u64,
    /// Fragment filenames, in timeline order.
    pub fragment_names: Vec<String>,
    pub file_list: PathBuf,
    pub appended_path: PathBuf,
}

/// The result of a complete download.
#[derive(Debug, Clone)]
pub struct SmoothDownload {
    /// The downloaded tracks, in download order (video then audio).
    pub tracks: Vec<TrackDownload>,
    /// The command to join the downloaded fragments, for the user to run.
    pub mux_command: Mp4BoxCommand,
}

impl SmoothDownload {
    pub fn track(&self, track: Track) -> Option<&TrackDownload> {
        self.tracks.iter().find(|td| td.track == track)
    }
}


impl SmoothDownloader {
    /// Create a `SmoothDownloader` for the presentation whose manifests are
    /// `{base_url}{manifest_name}.ismc` and `{base_url}{manifest_name}.ism`.
    pub fn new(base_url: &str, manifest_name: &str) -> SmoothDownloader {
        SmoothDownloader {
            base_url: String::from(base_url),
            manifest_name: String::from(manifest_name),
            output_dir: PathBuf::from("."),
            http_client: None,
            verbosity: 0,
            mux_inputs: MuxInputs::default(),
            mux_output: String::from("output.mp4"),
            progress_observers: vec![],
            mp4box_location: String::from("mp4box"),
        }
    }

    /// Specify the reqwest Client to be used for HTTP requests. Allows you to specify a proxy, the
    /// user agent, request timeouts, etc. The default client has no timeout.
    pub fn with_http_client(mut self, client: HttpClient) -> SmoothDownloader {
        self.http_client = Some(client);
        self
    }

    /// Add a observer implementing the ProgressObserver trait, that will receive updates concerning
    /// the progression of the download.
    pub fn add_progress_observer(mut self, observer: Arc<dyn ProgressObserver>) -> SmoothDownloader {
        self.progress_observers.push(observer);
        self
    }

    /// Directory where the manifests and the `video` and `audio` fragment directories are stored
    /// (default: the current directory).
    pub fn output_dir<P: Into<PathBuf>>(mut self, dir: P) -> SmoothDownloader {
        self.output_dir = dir.into();
        self
    }

    /// Which fragments are listed in the generated MP4Box command.
    pub fn mux_inputs(mut self, which: MuxInputs) -> SmoothDownloader {
        self.mux_inputs = which;
        self
    }

    /// Name of the output file in the generated MP4Box command (default `output.mp4`).
    pub fn mux_output(mut self, output: &str) -> SmoothDownloader {
        self.mux_output = String::from(output);
        self
    }

    /// Specify the name or location of the MP4Box application used in the generated command.
    pub fn with_mp4box(mut self, path: &str) -> SmoothDownloader {
        self.mp4box_location = String::from(path);
        self
    }

    /// Set the verbosity level of the download process.
    ///
    /// - 0: only the URL of each fragment that is fetched is printed
    /// - 1: information above + selected bitrates and number of fragments per track
    /// - 2: information above + manifest fetches and size of each track
    /// - 3 or larger: information above + size of each downloaded fragment
    pub fn verbosity(mut self, level: u8) -> SmoothDownloader {
        self.verbosity = level;
        self
    }

    pub fn ismc_file(&self) -> String {
        format!("{}.ismc", self.manifest_name)
    }

    pub fn ism_file(&self) -> String {
        format!("{}.ism", self.manifest_name)
    }

    /// URL of the fragment starting at `position` in the quality level of `track` with the given
    /// bitrate.
    pub fn fragment_url(&self, track: Track, bitrate: u64, position: u64) -> Result<Url, SmoothError> {
        let u = format!("{}{}/QualityLevels({bitrate})/Fragments({track}={position})",
                        self.base_url, self.ism_file());
        Url::parse(&u).map_err(|e| parse_error("building fragment URL", e))
    }

    /// Download the presentation. Returns once every fragment of the video and audio tracks is
    /// present in the output directory.
    pub async fn download(mut self) -> Result<SmoothDownload, SmoothError> {
        if self.http_client.is_none() {
            let client = reqwest::Client::builder()
                .build()
                .map_err(|e| network_error("building HTTP client", e))?;
            self.http_client = Some(client);
        }
        fetch_presentation(&self).await
    }
}


fn network_error(why: &str, e: impl std::error::Error) -> SmoothError {
    SmoothError::Network(format!("{why}: {e}"))
}

fn parse_error(why: &str, e: impl std::error::Error) -> SmoothError {
    SmoothError::Parsing(format!("{why}: {e:#?}"))
}

async fn path_exists(path: &Path) -> Result<bool, SmoothError> {
    fs::try_exists(path).await
        .map_err(|e| SmoothError::Io(e, format!("checking for {}", path.display())))
}


// Tracks the fraction of requests (manifests and fragments) processed, for the ProgressObservers.
struct Progress<'a> {
    observers: &'a [Arc<dyn ProgressObserver>],
    done: usize,
    total: usize,
}

impl Progress<'_> {
    fn advance(&mut self, message: &str) {
        self.done += 1;
        let percent = (100.0 * self.done as f32 / self.total.max(1) as f32).ceil() as u32;
        for observer in self.observers {
            observer.update(percent.min(100), message);
        }
    }
}


// GET the resource at url and write the response body to a new file at path, chunk by chunk as it
// arrives. Returns the number of octets written.
async fn stream_to_file(client: &HttpClient, url: &Url, path: &Path) -> Result<u64, SmoothError> {
    let response = client.get(url.clone())
        .send().await
        .map_err(|e| network_error(&format!("requesting {url}"), e))?
        .error_for_status()
        .map_err(|e| network_error(&format!("requesting {url}"), e))?;
    let file = File::create(path).await
        .map_err(|e| SmoothError::Io(e, format!("creating {}", path.display())))?;
    let mut out = BufWriter::new(file);
    let mut octets = 0;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| network_error(&format!("reading body of {url}"), e))?;
        out.write_all(&chunk).await
            .map_err(|e| SmoothError::Io(e, format!("writing {}", path.display())))?;
        octets += chunk.len() as u64;
    }
    out.flush().await
        .map_err(|e| SmoothError::Io(e, format!("flushing {}", path.display())))?;
    Ok(octets)
}

// Client manifests are UTF-8 unless a byte order mark says otherwise; IIS can write them as UTF-16.
fn decode_manifest(bytes: &[u8]) -> Result<Cow<'_, str>, SmoothError> {
    let (encoding, bom_length) = encoding_rs::Encoding::for_bom(bytes)
        .unwrap_or((encoding_rs::UTF_8, 0));
    encoding.decode_without_bom_handling_and_without_replacement(&bytes[bom_length..])
        .ok_or_else(|| SmoothError::Parsing(format!("malformed {} content", encoding.name())))
}

// Append the full content of the file at source to sink.
async fn append_file(source: &Path, sink: &mut BufWriter<File>) -> Result<u64, SmoothError> {
    let mut input = File::open(source).await
        .map_err(|e| SmoothError::Io(e, format!("opening {}", source.display())))?;
    tokio::io::copy(&mut input, sink).await
        .map_err(|e| SmoothError::Io(e, format!("appending {}", source.display())))
}


/// Fetch the manifest `filename` from the downloader's base URL into the output directory, unless a
/// file with that name is already present there (its content is then used as is). Returns the local
/// path of the manifest.
#[tracing::instrument(level = "debug", skip(downloader, client))]
pub async fn fetch_manifest_file(
    downloader: &SmoothDownloader,
    client: &HttpClient,
    filename: &str) -> Result<PathBuf, SmoothError>
{
    let path = downloader.output_dir.join(filename);
    if path_exists(&path).await? {
        debug!("Using existing manifest {}", path.display());
        return Ok(path);
    }
    let u = format!("{}{filename}", downloader.base_url);
    let url = Url::parse(&u)
        .map_err(|e| parse_error("building manifest URL", e))?;
    if downloader.verbosity > 1 {
        println!("Fetching manifest {url}");
    }
    let octets = stream_to_file(client, &url, &path).await?;
    info!("Fetched manifest {url} ({octets} octets)");
    Ok(path)
}


// Download every fragment of one track into the directory named after the track. The file list is
// recreated and the appended file truncated on each run; fragment files that already exist are
// appended without being fetched again.
#[tracing::instrument(level = "debug", skip_all, fields(track = %plan.track, bitrate = plan.bitrate))]
async fn download_track(
    downloader: &SmoothDownloader,
    client: &HttpClient,
    plan: &TrackPlan,
    progress: &mut Progress<'_>) -> Result<TrackDownload, SmoothError>
{
    let track = plan.track;
    let start_download = Instant::now();
    let track_dir = downloader.output_dir.join(track.name());
    fs::create_dir_all(&track_dir).await
        .map_err(|e| SmoothError::Io(e, format!("creating {track} fragment directory")))?;

    let file_list = track_dir.join("filelist.txt");
    if path_exists(&file_list).await? {
        fs::remove_file(&file_list).await
            .map_err(|e| SmoothError::Io(e, format!("removing {track} file list")))?;
    }
    let list = File::create(&file_list).await
        .map_err(|e| SmoothError::Io(e, format!("creating {track} file list")))?;
    let mut list = BufWriter::new(list);

    let appended_path = track_dir.join(track.appended_name());
    let appended = File::create(&appended_path).await
        .map_err(|e| SmoothError::Io(e, format!("creating {track} appended file")))?;
    let mut appended = BufWriter::new(appended);

    let mut fragment_names = Vec::with_capacity(plan.positions.len());
    let mut fetched = 0;
    let mut total_octets = 0;
    for (i, position) in plan.positions.iter().enumerate() {
        let url = downloader.fragment_url(track, plan.bitrate, *position)?;
        let name = track.fragment_name(i);
        let path = track_dir.join(&name);
        list.write_all(format!("file '{name}'\n").as_bytes()).await
            .map_err(|e| SmoothError::Io(e, format!("writing {track} file list")))?;
        // Presence on disk is all we check: a truncated fragment from an interrupted run is reused.
        if !path_exists(&path).await? {
            println!("Downloading {url}");
            let octets = stream_to_file(client, &url, &path).await?;
            if downloader.verbosity > 2 {
                println!("  {track} fragment {i} -> {octets} octets");
            }
            fetched += 1;
        }
        total_octets += append_file(&path, &mut appended).await?;
        fragment_names.push(name);
        progress.advance(&format!("Fetching {track} fragments"));
    }
    list.flush().await
        .map_err(|e| SmoothError::Io(e, format!("flushing {track} file list")))?;
    appended.flush().await
        .map_err(|e| SmoothError::Io(e, format!("flushing {track} appended file")))?;
    info!("{track}: {} fragments ({fetched} fetched), {total_octets} octets", fragment_names.len());
    if downloader.verbosity > 1 {
        let mbytes = total_octets as f64 / (1024.0 * 1024.0);
        let elapsed = start_download.elapsed();
        println!("  Wrote {mbytes:.1}MB to {} ({:.1}MB/s)",
                 appended_path.display(), mbytes / elapsed.as_secs_f64().max(f64::EPSILON));
    }
    Ok(TrackDownload {
        track,
        bitrate: plan.bitrate,
        fragment_names,
        file_list,
        appended_path,
    })
}


async fn fetch_presentation(downloader: &SmoothDownloader) -> Result<SmoothDownload, SmoothError> {
    let client = downloader.http_client.as_ref()
        .ok_or_else(|| SmoothError::Network(String::from("no HTTP client configured")))?;
    fs::create_dir_all(&downloader.output_dir).await
        .map_err(|e| SmoothError::Io(e, String::from("creating output directory")))?;
    let mut progress = Progress {
        observers: &downloader.progress_observers,
        done: 0,
        total: 2,
    };
    let ismc_path = fetch_manifest_file(downloader, client, &downloader.ismc_file()).await?;
    progress.advance("Fetching client manifest");
    // The server manifest is kept alongside the client manifest but isn't needed to locate fragments.
    fetch_manifest_file(downloader, client, &downloader.ism_file()).await?;
    progress.advance("Fetching server manifest");

    let bytes = fs::read(&ismc_path).await
        .map_err(|e| SmoothError::Io(e, format!("reading {}", ismc_path.display())))?;
    let xml = decode_manifest(&bytes)
        .map_err(|e| parse_error(&format!("decoding {}", ismc_path.display()), e))?;
    let manifest = parse(&xml)
        .map_err(|e| parse_error("parsing Smooth Streaming client manifest", e))?;
    let plans = plan_tracks(&manifest)?;
    progress.total += plans.iter().map(|p| p.positions.len()).sum::<usize>();
    for plan in &plans {
        info!("Selected {} bitrate {} with {} fragments", plan.track, plan.bitrate, plan.positions.len());
        if downloader.verbosity > 0 {
            println!("{} stream selected: bitrate={} Kbps, {} fragments",
                     plan.track, plan.bitrate / 1000, plan.positions.len());
        }
    }

    // We could download these fragments in parallel, but that might upset some servers.
    let mut tracks = Vec::with_capacity(plans.len());
    for plan in &plans {
        tracks.push(download_track(downloader, client, plan, &mut progress).await?);
    }
    let mux_command = Mp4BoxCommand::for_tracks(
        &downloader.mp4box_location,
        &downloader.mux_output,
        downloader.mux_inputs,
        tracks.iter().map(|td| (td.track, td.fragment_names.as_slice())));
    Ok(SmoothDownload { tracks, mux_command })
}
