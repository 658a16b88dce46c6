//! Pattern files used to exclude (blacklist.txt), ignore (ignorelist.txt)
//! or force-flag (game_has_dlc.txt) paths and game slugs.
//!
//! File grammar: one `<flags> <pattern>` entry per line, `#` at column 0
//! starts a comment. Flag `R` marks the pattern as a regex, `p` marks
//! perl-compatible syntax, which is also the default and therefore
//! ignored. Anything else warns and the flag is skipped.

use std::path::Path;

use regex::Regex;

const FLAG_REGEX: u32 = 1 << 0;
const FLAG_PERL: u32 = 1 << 1;

#[derive(Clone, Debug)]
struct BlacklistItem {
    regex: Regex,
}

#[derive(Clone, Debug, Default)]
pub struct Blacklist {
    items: Vec<BlacklistItem>,
}

impl Blacklist {
    /// Reads a pattern file. A missing file yields an empty list.
    pub fn from_file(path: &Path) -> Blacklist {
        match std::fs::read_to_string(path) {
            Ok(text) => Blacklist::from_lines(text.lines()),
            Err(_) => Blacklist::default(),
        }
    }

    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Blacklist {
        let mut items = Vec::new();
        for (idx, raw) in lines.into_iter().enumerate() {
            let linenr = idx + 1;
            if raw.is_empty() || raw.starts_with('#') {
                continue;
            }

            let mut flags = 0u32;
            let mut split = raw.len();
            for (i, c) in raw.char_indices() {
                if c == ' ' {
                    split = i;
                    break;
                }
                match c {
                    'R' => flags |= FLAG_REGEX,
                    'p' => flags |= FLAG_PERL,
                    other => eprintln!("unknown flag '{}' in blacklist line {}", other, linenr),
                }
            }

            let pattern = raw[split..].trim_start();
            if pattern.is_empty() {
                eprintln!("empty expression in blacklist line {}", linenr);
                continue;
            }

            if flags & FLAG_REGEX != 0 {
                match Regex::new(pattern) {
                    Ok(regex) => items.push(BlacklistItem { regex }),
                    Err(e) => eprintln!("invalid expression in blacklist line {}: {}", linenr, e),
                }
            } else {
                eprintln!("unknown expression type in blacklist line {}", linenr);
            }
        }
        Blacklist { items }
    }

    pub fn is_blacklisted(&self, path: &str) -> bool {
        self.items.iter().any(|item| item.regex.is_match(path))
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flagged_patterns() {
        let bl = Blacklist::from_lines(vec![
            "# comment line",
            "",
            "Rp .*\\.mp4$",
            "R ^foo_game/extras/",
        ]);
        assert_eq!(bl.len(), 2);
        assert!(bl.is_blacklisted("foo_game/video.mp4"));
        assert!(bl.is_blacklisted("foo_game/extras/wallpaper.zip"));
        assert!(!bl.is_blacklisted("foo_game/setup_foo.exe"));
    }

    #[test]
    fn perl_flag_alone_is_not_a_regex_entry() {
        // 'p' without 'R' never marked an entry as usable in the file
        // grammar; such lines are rejected.
        let bl = Blacklist::from_lines(vec!["p .*\\.mp4$"]);
        assert!(bl.is_empty());
    }

    #[test]
    fn rejects_bad_expressions() {
        let bl = Blacklist::from_lines(vec!["R [unclosed"]);
        assert!(bl.is_empty());
    }

    #[test]
    fn missing_file_is_empty() {
        let bl = Blacklist::from_file(Path::new("/nonexistent/blacklist.txt"));
        assert!(bl.is_empty());
        assert!(!bl.is_blacklisted("anything"));
    }
}
