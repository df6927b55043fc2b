//! Filename selection and ordering strategies for directory locators.

/// Case-sensitive glob match supporting `*`, `?`, and `[...]` character
/// classes (with `!` negation and `a-z` ranges).
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    match_inner(&pattern, &name)
}

fn match_inner(pattern: &[char], name: &[char]) -> bool {
    if pattern.is_empty() {
        return name.is_empty();
    }
    match pattern[0] {
        '*' => {
            // Try every possible span for the star, shortest first.
            for skip in 0..=name.len() {
                if match_inner(&pattern[1..], &name[skip..]) {
                    return true;
                }
            }
            false
        }
        '?' => !name.is_empty() && match_inner(&pattern[1..], &name[1..]),
        '[' => {
            let Some(close) = pattern.iter().position(|&c| c == ']').filter(|&i| i > 1) else {
                // Unterminated class matches a literal '['.
                return !name.is_empty()
                    && name[0] == '['
                    && match_inner(&pattern[1..], &name[1..]);
            };
            if name.is_empty() {
                return false;
            }
            let class = &pattern[1..close];
            let (negated, class) = if class[0] == '!' {
                (true, &class[1..])
            } else {
                (false, class)
            };
            if class_contains(class, name[0]) != negated {
                match_inner(&pattern[close + 1..], &name[1..])
            } else {
                false
            }
        }
        literal => !name.is_empty() && name[0] == literal && match_inner(&pattern[1..], &name[1..]),
    }
}

fn class_contains(class: &[char], candidate: char) -> bool {
    let mut index = 0;
    while index < class.len() {
        if index + 2 < class.len() && class[index + 1] == '-' {
            if (class[index]..=class[index + 2]).contains(&candidate) {
                return true;
            }
            index += 3;
        } else {
            if class[index] == candidate {
                return true;
            }
            index += 1;
        }
    }
    false
}

/// Ordering strategy over `(path, mtime)` pairs. Entries without an mtime
/// sort last under both directions.
pub trait FileSortStrategy: Send + Sync {
    fn sort(&self, items: Vec<(String, Option<i64>)>) -> Vec<(String, Option<i64>)>;
}

/// Sort by modification time, oldest first by default.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModifiedTimeSort {
    pub descending: bool,
}

impl FileSortStrategy for ModifiedTimeSort {
    fn sort(&self, items: Vec<(String, Option<i64>)>) -> Vec<(String, Option<i64>)> {
        let (mut known, unknown): (Vec<_>, Vec<_>) =
            items.into_iter().partition(|(_, mtime)| mtime.is_some());
        known.sort_by_key(|(_, mtime)| mtime.unwrap_or(0));
        if self.descending {
            known.reverse();
        }
        known.extend(unknown);
        known
    }
}

/// Sort lexicographically by path.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicographicalSort {
    pub descending: bool,
}

impl FileSortStrategy for LexicographicalSort {
    fn sort(&self, items: Vec<(String, Option<i64>)>) -> Vec<(String, Option<i64>)> {
        let mut items = items;
        items.sort_by(|a, b| a.0.cmp(&b.0));
        if self.descending {
            items.reverse();
        }
        items
    }
}

/// Extra filter applied after the glob pattern.
pub trait FilenameFilter: Send + Sync {
    fn keep(&self, filename: &str) -> bool;
}

/// Keeps files whose name embeds a date at or after `start_date`. The first
/// run of eight contiguous digits is compared as `YYYYMMDD`.
#[derive(Debug, Clone)]
pub struct DateFilenameFilter {
    pub start_date: String,
}

impl DateFilenameFilter {
    pub fn new(start_date: impl Into<String>) -> Self {
        DateFilenameFilter {
            start_date: start_date.into(),
        }
    }
}

impl FilenameFilter for DateFilenameFilter {
    fn keep(&self, filename: &str) -> bool {
        let mut digits = String::new();
        for c in filename.chars() {
            if c.is_ascii_digit() {
                digits.push(c);
                if digits.len() == 8 {
                    return digits.as_str() >= self.start_date.as_str();
                }
            } else {
                digits.clear();
            }
        }
        false
    }
}
