//! Construction of the MP4Box command line that joins downloaded fragments.
//!
//! The command is only built and shown to the user; it is never run as a subprocess.

use std::fmt;
use crate::Track;


/// Which downloaded fragments are listed as `-cat` inputs of the mux command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MuxInputs {
    /// Only the fragments of the last track downloaded (the audio track), named by their bare
    /// filename. This is the historical behaviour of the tool.
    #[default]
    LastTrack,
    /// The fragments of every track, named relative to the output directory
    /// (`video/fragment_0.ismv`, ..., `audio/fragment_0.isma`, ...).
    AllTracks,
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mp4BoxCommand {
    pub program: String,
    pub inputs: Vec<String>,
    pub output: String,
}

impl Mp4BoxCommand {
    pub fn new(program: &str, output: &str) -> Mp4BoxCommand {
        Mp4BoxCommand {
            program: String::from(program),
            inputs: Vec::new(),
            output: String::from(output),
        }
    }

    /// Append an input to be concatenated with `-cat`.
    pub fn cat<S: Into<String>>(mut self, input: S) -> Mp4BoxCommand {
        self.inputs.push(input.into());
        self
    }

    /// Build the command for the fragment names of each downloaded track, given in download
    /// order.
    pub fn for_tracks<'a, I>(program: &str, output: &str, which: MuxInputs, tracks: I) -> Mp4BoxCommand
    where
        I: IntoIterator<Item = (Track, &'a [String])>,
    {
        let mut cmd = Mp4BoxCommand::new(program, output);
        match which {
            MuxInputs::LastTrack => {
                if let Some((_, names)) = tracks.into_iter().last() {
                    for name in names {
                        cmd = cmd.cat(name.as_str());
                    }
                }
            },
            MuxInputs::AllTracks => {
                for (track, names) in tracks {
                    for name in names {
                        cmd = cmd.cat(format!("{}/{name}", track.name()));
                    }
                }
            },
        }
        cmd
    }

    /// The arguments following the program name.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(2 * self.inputs.len() + 2);
        for input in &self.inputs {
            args.push(String::from("-cat"));
            args.push(input.clone());
        }
        args.push(String::from("-out"));
        args.push(self.output.clone());
        args
    }
}

impl fmt::Display for Mp4BoxCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in self.args() {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn names(track: Track, count: usize) -> Vec<String> {
        (0..count).map(|i| track.fragment_name(i)).collect()
    }

    #[test]
    fn test_command_line() {
        let cmd = Mp4BoxCommand::new("mp4box", "output.mp4")
            .cat("fragment_0.ismv")
            .cat("fragment_1.ismv");
        assert_eq!(cmd.to_string(),
                   "mp4box -cat fragment_0.ismv -cat fragment_1.ismv -out output.mp4");
        let empty = Mp4BoxCommand::new("MP4Box", "out.mp4");
        assert_eq!(empty.to_string(), "MP4Box -out out.mp4");
    }

    #[test]
    fn test_last_track_only() {
        let video = names(Track::Video, 3);
        let audio = names(Track::Audio, 2);
        let cmd = Mp4BoxCommand::for_tracks(
            "mp4box", "output.mp4", MuxInputs::LastTrack,
            [(Track::Video, video.as_slice()), (Track::Audio, audio.as_slice())]);
        assert_eq!(cmd.to_string(),
                   "mp4box -cat fragment_0.isma -cat fragment_1.isma -out output.mp4");
    }

    #[test]
    fn test_all_tracks() {
        let video = names(Track::Video, 1);
        let audio = names(Track::Audio, 1);
        let cmd = Mp4BoxCommand::for_tracks(
            "mp4box", "output.mp4", MuxInputs::AllTracks,
            [(Track::Video, video.as_slice()), (Track::Audio, audio.as_slice())]);
        assert_eq!(cmd.inputs, vec!["video/fragment_0.ismv", "audio/fragment_0.isma"]);
        assert_eq!(cmd.args().len(), 6);
    }
}
