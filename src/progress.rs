//! Progress mapper for dependency-manager output
//!
//! Turns free-form lines such as "Loading composer repositories" or
//! "Installing vendor/package" into a percentage. The value never decreases
//! and lines that look like errors never move it.

use regex::Regex;
use std::sync::LazyLock;

static ERROR_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(failed|fatal|error|could not|permission denied)\b")
        .expect("error hint pattern is valid")
});

/// What a matched line does to the percentage
#[derive(Debug, Clone, Copy)]
enum Phase {
    Fixed(u8),
    DownloadingFromCache,
    Downloading,
    Installing,
}

/// Ordered table; the first matching pattern wins.
static PHASES: LazyLock<Vec<(Regex, Phase)>> = LazyLock::new(|| {
    [
        (r"(?i)\bloading composer repositories\b", Phase::Fixed(5)),
        (r"(?i)\breading .*composer\.json\b", Phase::Fixed(8)),
        (r"(?i)\bupdating dependencies\b", Phase::Fixed(15)),
        (r"(?i)\bresolving dependencies\b", Phase::Fixed(20)),
        (r"(?i)\bwriting lock file\b", Phase::Fixed(35)),
        (r"(?i)\bpackage operations:\s*\d+\s+install(?:s)?\b", Phase::Fixed(45)),
        (r"(?i)\bdownloading.*from cache\b", Phase::DownloadingFromCache),
        (r"(?i)\bdownloading\b", Phase::Downloading),
        (r"(?i)\binstalling\b", Phase::Installing),
        (r"(?i)\bgenerating autoload files\b", Phase::Fixed(90)),
        (r"(?i)\bno changes required\b", Phase::Fixed(95)),
    ]
    .into_iter()
    .map(|(pattern, phase)| (Regex::new(pattern).expect("phase pattern is valid"), phase))
    .collect()
});

const DOWNLOAD_FLOOR: u8 = 30;
const CACHED_DOWNLOAD_FLOOR: u8 = 55;
const DOWNLOAD_CAP: u8 = 60;
const INSTALL_FLOOR: u8 = 60;
const INSTALL_CAP: u8 = 85;

/// Monotonic percentage estimator for one step.
#[derive(Debug, Clone, Default)]
pub struct ProgressMapper {
    last: u8,
    seen_downloading: bool,
    seen_installing: bool,
}

impl ProgressMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last reported percentage
    pub fn last(&self) -> u8 {
        self.last
    }

    /// Observe one sanitized line. Returns the new percentage if it advanced.
    pub fn observe(&mut self, line: &str) -> Option<u8> {
        if line.is_empty() || ERROR_HINT.is_match(line) {
            return None;
        }
        let (_, phase) = PHASES.iter().find(|(re, _)| re.is_match(line))?;
        match *phase {
            Phase::Fixed(target) => self.advance_to(target),
            Phase::DownloadingFromCache => self.downloading(true),
            Phase::Downloading => self.downloading(false),
            Phase::Installing => self.installing(),
        }
    }

    fn downloading(&mut self, from_cache: bool) -> Option<u8> {
        if !self.seen_downloading {
            self.seen_downloading = true;
            let target = if from_cache {
                self.last.max(CACHED_DOWNLOAD_FLOOR).min(DOWNLOAD_CAP)
            } else {
                self.last.max(DOWNLOAD_FLOOR)
            };
            return self.advance_to(target);
        }
        if self.last >= DOWNLOAD_CAP {
            return None;
        }
        self.advance_to((self.last + 1).min(DOWNLOAD_CAP))
    }

    fn installing(&mut self) -> Option<u8> {
        if !self.seen_installing {
            self.seen_installing = true;
            return self.advance_to(self.last.max(INSTALL_FLOOR));
        }
        if self.last >= INSTALL_CAP {
            return None;
        }
        self.advance_to((self.last + 1).min(INSTALL_CAP))
    }

    fn advance_to(&mut self, target: u8) -> Option<u8> {
        let target = target.min(100);
        if target <= self.last {
            return None;
        }
        self.last = target;
        Some(target)
    }
}
