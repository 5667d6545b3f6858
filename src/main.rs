// smoothstream-dl
//
// Run with `cargo run -- --base-url http://example.com/videos/ --manifest asset-1`
//
// Downloads the highest-bitrate video and audio tracks of a Smooth Streaming presentation into the
// output directory, then prints the MP4Box command that joins the fragments. The command is not run.

use std::path::PathBuf;
use std::process::ExitCode;
use clap::{ArgAction, Parser};
use tracing::error;
use smoothstream_dl::fetch::{SmoothDownloader, DEFAULT_BASE_URL, DEFAULT_MANIFEST_NAME};
use smoothstream_dl::mp4box::MuxInputs;


/// Exit status of a run stopped because the manifest lacks an expected stream, quality level or
/// timeline.
const EXIT_REPORTED_ABORT: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "smoothstream-dl", version,
          about = "Download the highest-bitrate tracks of a Smooth Streaming presentation")]
struct Args {
    /// URL of the directory containing the manifests, including the trailing slash
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Basename of the .ism and .ismc manifests
    #[arg(long, short, default_value = DEFAULT_MANIFEST_NAME)]
    manifest: String,

    /// Directory for the manifests and the video/ and audio/ fragment directories
    #[arg(long, short, default_value = ".")]
    output_dir: PathBuf,

    /// MP4Box program named in the printed command
    #[arg(long, default_value = "mp4box")]
    mp4box: String,

    /// Output file named in the printed command
    #[arg(long, default_value = "output.mp4")]
    out: String,

    /// List the fragments of both tracks in the printed command, rather than only the audio track's
    #[arg(long)]
    mux_all_tracks: bool,

    /// Print more information (repeat for more detail)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}


fn setup_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let fmt_layer = fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(false);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,reqwest=warn,hyper=warn,hyper_util=warn"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    setup_logging();
    let args = Args::parse();
    let mux_inputs = if args.mux_all_tracks { MuxInputs::AllTracks } else { MuxInputs::LastTrack };
    let downloader = SmoothDownloader::new(&args.base_url, &args.manifest)
        .output_dir(args.output_dir)
        .with_mp4box(&args.mp4box)
        .mux_output(&args.out)
        .mux_inputs(mux_inputs)
        .verbosity(args.verbose);
    match downloader.download().await {
        Ok(download) => {
            println!("{}", download.mux_command);
            ExitCode::SUCCESS
        },
        Err(e) if e.is_reported_abort() => {
            println!("ERROR: {e}");
            ExitCode::from(EXIT_REPORTED_ABORT)
        },
        Err(e) => {
            error!("Download failed: {e}");
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        },
    }
}
