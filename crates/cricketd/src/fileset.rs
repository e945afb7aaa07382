//! Files and filesets.
//!
//! Crickets address MP3s by `(folder, file)` index on their SD card;
//! the server additionally knows each file's playback duration so it
//! can schedule around it. A fileset is a named subset of the global
//! file dictionary, selected by regex over the dictionary keys.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use regex::Regex;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum FilesetError {
    #[error("fileset {name:?}: failed to compile regex {regex:?}: {source}")]
    BadRegex {
        name: String,
        regex: String,
        source: regex::Error,
    },

    #[error("fileset {name:?}: regex {regex:?} matches no files")]
    Empty { name: String, regex: String },
}

/// One MP3 file as addressed on a cricket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct File {
    /// Folder number on the device (1..=99).
    pub folder: u8,
    /// File number within the folder (1..=255).
    pub file: u8,
    /// Playback duration in seconds, excluding any client-side delay.
    pub duration: f64,
}

impl fmt::Display for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:02} ({:.3})", self.folder, self.file, self.duration)
    }
}

impl From<&cricketconf::FileConfig> for File {
    fn from(c: &cricketconf::FileConfig) -> Self {
        File {
            folder: c.folder,
            file: c.file,
            duration: c.duration,
        }
    }
}

/// A named, non-empty set of files.
#[derive(Debug)]
pub struct FileSet {
    name: String,
    files: Vec<File>,
}

impl FileSet {
    /// Build a fileset by matching `regex` against the keys of the
    /// global file dictionary. An empty result is a config error: every
    /// algorithm that takes a fileset assumes it can pick from it.
    pub fn new<'a, I>(name: &str, regex: &str, files: I) -> Result<FileSet, FilesetError>
    where
        I: IntoIterator<Item = (&'a String, &'a cricketconf::FileConfig)>,
    {
        let re = Regex::new(regex).map_err(|source| FilesetError::BadRegex {
            name: name.to_string(),
            regex: regex.to_string(),
            source,
        })?;

        let mut matched: Vec<File> = files
            .into_iter()
            .filter(|(key, _)| re.is_match(key))
            .map(|(_, f)| File::from(f))
            .collect();
        matched.sort_by_key(|f| (f.folder, f.file));

        if matched.is_empty() {
            return Err(FilesetError::Empty {
                name: name.to_string(),
                regex: regex.to_string(),
            });
        }
        Ok(FileSet {
            name: name.to_string(),
            files: matched,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// All files, in ascending `(folder, file)` order.
    pub fn files(&self) -> &[File] {
        &self.files
    }

    pub fn average_duration(&self) -> Duration {
        let total: f64 = self.files.iter().map(|f| f.duration).sum();
        Duration::from_secs_f64(total / self.files.len() as f64)
    }

    /// Pick a file uniformly at random.
    pub fn pick(&self) -> File {
        pick(&self.files)
    }

    /// Pick a file and a repetition count that fit before `deadline`.
    ///
    /// Tries a uniform pick first; if that file can't play even once
    /// before the deadline, retries among the files short enough to
    /// fit. Returns a zero-rep [`PlaySpec`] when nothing fits —
    /// the caller's signal that the effect is out of time.
    pub fn pick_carefully(
        &self,
        deadline: Instant,
        reps: u32,
        delay: Duration,
        jitter: Duration,
    ) -> PlaySpec {
        let reps = reps.max(1);

        let mut file = self.pick();
        let mut actual_reps = reps.min(reps_before(file, deadline, delay));
        if actual_reps == 0 {
            let remaining = deadline
                .saturating_duration_since(Instant::now())
                .as_secs_f64();
            let fitting: Vec<File> = self
                .files
                .iter()
                .copied()
                .filter(|f| f.duration < remaining)
                .collect();
            if fitting.is_empty() {
                return PlaySpec::default();
            }
            file = pick(&fitting);
            actual_reps = reps.min(reps_before(file, deadline, delay));
            if actual_reps == 0 {
                return PlaySpec::default();
            }
        }

        PlaySpec {
            file,
            reps: actual_reps,
            delay,
            jitter,
        }
    }
}

impl fmt::Display for FileSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listed: Vec<String> = self.files.iter().map(|x| x.to_string()).collect();
        write!(f, "{} ({})", self.name, listed.join(", "))
    }
}

fn pick(files: &[File]) -> File {
    files[rand::thread_rng().gen_range(0..files.len())]
}

/// How many times could `file` play before `deadline`, with `delay`
/// between repetitions? The final delay isn't actually waited for, so
/// it's credited back to the remaining time.
fn reps_before(file: File, deadline: Instant, delay: Duration) -> u32 {
    let remaining =
        deadline.saturating_duration_since(Instant::now()).as_secs_f64() + delay.as_secs_f64();
    let per_rep = file.duration + delay.as_secs_f64();
    (remaining / per_rep).floor() as u32
}

/// A single file-play command: which file, how many times, with what
/// spacing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaySpec {
    pub file: File,
    pub reps: u32,
    pub delay: Duration,
    pub jitter: Duration,
}

impl Default for File {
    fn default() -> Self {
        File {
            folder: 0,
            file: 0,
            duration: 0.0,
        }
    }
}

impl PlaySpec {
    /// Expected on-device duration. The device plays `reps` files with
    /// `delay` *between* them — there's no delay after the last rep, so
    /// one delay is subtracted. Jitter happens on the client and isn't
    /// counted.
    pub fn duration(&self) -> Duration {
        if self.reps == 0 {
            return Duration::ZERO;
        }
        let delay = self.delay.as_secs_f64();
        let total = (self.file.duration + delay) * f64::from(self.reps) - delay;
        Duration::from_secs_f64(total.max(0.0))
    }
}

impl fmt::Display for PlaySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:2}/{:2} ({} reps, {:.3} delay, {:.3} jitter, expected time {:.2} sec)",
            self.file.folder,
            self.file.file,
            self.reps,
            self.delay.as_secs_f64(),
            self.jitter.as_secs_f64(),
            self.duration().as_secs_f64(),
        )
    }
}
