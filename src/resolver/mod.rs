use crate::commands;
use crate::executor::Action;
use crate::model::{CatalogEntry, ResolvedMatch};
use std::sync::OnceLock;

pub const DEFAULT_THRESHOLD: f64 = 0.70;

const FILLER_PHRASES: &[&str] = &[
    "please", "plz", "the", "app", "program", "application", "run", "start", "launch", "move",
    "go", "come", "open", "open the", "open this", "open up", "open now", "open it",
    "open it up", "open my app", "open the app", "open the application", "open this app",
    "open my program", "open that app", "please open", "please open the", "please open this app",
    "can you open", "can you open the", "could you open", "let me open", "let me open the",
    "show me", "open up the", "i want to open", "i want", "open my application", "launch the",
    "launch the app", "launch this", "launch this app", "please launch", "please launch the",
    "could you launch", "could you launch please", "launch my app", "let me launch",
    "let me launch the", "i want to lunch", "start launching", "please launch the app",
    "launch my application", "could you please launch", "start the", "start this",
    "start this app", "start the app", "please start", "please start the",
    "please start the app", "start opening", "start the program", "can i start",
    "i want to start", "start my application", "run the", "run this", "run this app",
    "run the app", "please run", "please run the", "let me run", "let me run the", "can you run",
    "can you run the", "run my application", "can i launch", "would you open", "can i open",
    "would you", "can you", "hey bro", "hey babby", "hey buddy", "hey dude",
];

/// Filler phrases split into words, longest phrase first.
fn filler_phrases() -> &'static [Vec<&'static str>] {
    static PHRASES: OnceLock<Vec<Vec<&'static str>>> = OnceLock::new();
    PHRASES.get_or_init(|| {
        let mut phrases: Vec<&'static str> = FILLER_PHRASES.to_vec();
        phrases.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
        phrases.dedup();
        phrases
            .into_iter()
            .map(|phrase| phrase.split_whitespace().collect())
            .collect()
    })
}

fn strip_fillers<'a>(tokens: &[&'a str]) -> Vec<&'a str> {
    let mut kept = Vec::with_capacity(tokens.len());
    let mut pos = 0;
    while pos < tokens.len() {
        let rest = &tokens[pos..];
        let filler = filler_phrases()
            .iter()
            .find(|phrase| rest.starts_with(phrase.as_slice()));
        match filler {
            Some(phrase) => pos += phrase.len(),
            None => {
                kept.push(tokens[pos]);
                pos += 1;
            }
        }
    }
    kept
}

/// Lower-cases `query` and drops filler phrases, keeping the remaining words.
///
/// Passes repeat until nothing more is stripped, so words that only become
/// adjacent after a removal ("hey open dude" -> "hey dude") are handled too
/// and the function is idempotent.
pub fn extract_keywords(query: &str) -> String {
    let lowered = query.to_lowercase();
    let mut tokens: Vec<&str> = lowered.split_whitespace().collect();
    loop {
        let next = strip_fillers(&tokens);
        if next.len() == tokens.len() {
            break;
        }
        tokens = next;
    }
    tokens.join(" ")
}

/// Similarity in [0, 1] from the insertion/deletion edit distance:
/// `1 - distance / (len(a) + len(b))`, which equals `2 * lcs / (len(a) + len(b))`.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }

    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for ca in &a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    let lcs = prev[b.len()];
    (2 * lcs) as f64 / total as f64
}

fn as_percentage(ratio: f64) -> f64 {
    (ratio * 10_000.0).round() / 100.0
}

/// Ranks catalog entries against the keywords of `query`.
///
/// Entries scoring below `threshold` are dropped; equal scores keep catalog
/// order.
pub fn match_apps(query: &str, catalog: &[CatalogEntry], threshold: f64) -> Vec<ResolvedMatch> {
    let search = extract_keywords(query);
    let mut scored: Vec<(f64, &CatalogEntry)> = catalog
        .iter()
        .map(|entry| (similarity_ratio(&search, &entry.app_name.to_lowercase()), entry))
        .filter(|(ratio, _)| *ratio >= threshold)
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored
        .into_iter()
        .map(|(ratio, entry)| ResolvedMatch {
            app_id: entry.app_id.clone(),
            app_name: entry.app_name.clone(),
            similarity: as_percentage(ratio),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    LaunchApp {
        app_id: String,
        matches: Vec<ResolvedMatch>,
    },
    Command {
        phrase: String,
        action: Action,
    },
    NoMatch {
        extracted: String,
        catalog_loaded: bool,
    },
}

/// Turns free text into an app launch, a static command, or no match.
///
/// `catalog` is `None` while the catalog has not been built yet.
pub fn resolve_command(
    query: &str,
    catalog: Option<&[CatalogEntry]>,
    threshold: f64,
) -> Resolution {
    if let Some(entries) = catalog {
        let matches = match_apps(query, entries, threshold);
        if let Some(best) = matches.first() {
            return Resolution::LaunchApp {
                app_id: best.app_id.clone(),
                matches,
            };
        }
    }

    let extracted = extract_keywords(query);
    match commands::lookup_phrase(&extracted) {
        Some(entry) => Resolution::Command {
            phrase: extracted,
            action: entry.action.clone(),
        },
        None => Resolution::NoMatch {
            extracted,
            catalog_loaded: catalog.is_some(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(entries: &[(&str, &str)]) -> Vec<CatalogEntry> {
        entries
            .iter()
            .map(|(id, name)| CatalogEntry {
                app_id: id.to_string(),
                app_name: name.to_string(),
            })
            .collect()
    }

    #[test]
    fn strips_longest_filler_first() {
        assert_eq!(extract_keywords("please open netflix"), "netflix");
        assert_eq!(extract_keywords("Could you please launch Prime Video"), "prime video");
        assert_eq!(extract_keywords("open the app youtube"), "youtube");
        assert_eq!(extract_keywords("hey dude run the app spotify now"), "spotify now");
    }

    #[test]
    fn keeps_non_filler_words_in_order() {
        assert_eq!(extract_keywords("volume up"), "volume up");
        assert_eq!(extract_keywords("  Channel   DOWN "), "channel down");
        assert_eq!(extract_keywords("please open"), "");
        assert_eq!(extract_keywords(""), "");
    }

    #[test]
    fn extraction_is_idempotent() {
        let queries = [
            "please open netflix",
            "hey open dude",
            "can you open the hotstar app",
            "I want to open my app disney plus",
            "start start start",
            "go come move",
            "the the netflix the",
            "run this app please amazon prime",
            "",
        ];
        for query in queries {
            let once = extract_keywords(query);
            assert_eq!(extract_keywords(&once), once, "query {query:?}");
        }
        assert_eq!(extract_keywords("hey open dude"), "");
    }

    #[test]
    fn similarity_bounds() {
        assert_eq!(similarity_ratio("netflix", "netflix"), 1.0);
        assert_eq!(similarity_ratio("", ""), 1.0);
        assert_eq!(similarity_ratio("abc", ""), 0.0);
        assert_eq!(similarity_ratio("abc", "xyz"), 0.0);
        let r = similarity_ratio("netflx", "netflix");
        assert!(r > 0.9 && r < 1.0, "{r}");
    }

    #[test]
    fn similarity_matches_lcs_ratio() {
        // lcs("youtube", "youtube kids") = 7 -> 14 / 19
        let r = similarity_ratio("youtube", "youtube kids");
        assert!((r - 14.0 / 19.0).abs() < 1e-12);
    }

    #[test]
    fn match_apps_ranks_and_reports_percentages() {
        let apps = catalog(&[
            ("com.google.android.youtube.tv", "YouTube"),
            ("com.netflix.ninja", "Netflix"),
            ("com.amazon.firetv.youtube.kids", "YouTube Kids"),
        ]);
        let matches = match_apps("open youtube", &apps, DEFAULT_THRESHOLD);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].app_id, "com.google.android.youtube.tv");
        assert_eq!(matches[0].similarity, 100.0);
        assert_eq!(matches[1].app_id, "com.amazon.firetv.youtube.kids");
        assert_eq!(matches[1].similarity, 73.68);
    }

    #[test]
    fn equal_scores_keep_catalog_order() {
        let apps = catalog(&[("b.first", "Plex"), ("a.second", "plex"), ("c.third", "PLEX")]);
        let ids: Vec<String> = match_apps("plex", &apps, DEFAULT_THRESHOLD)
            .into_iter()
            .map(|m| m.app_id)
            .collect();
        assert_eq!(ids, ["b.first", "a.second", "c.third"]);
    }

    #[test]
    fn raising_threshold_never_adds_results() {
        let apps = catalog(&[
            ("a", "Netflix"),
            ("b", "Netflix Kids"),
            ("c", "Nebula"),
            ("d", "Twitch"),
        ]);
        let mut previous: Option<Vec<String>> = None;
        for step in 0..=20 {
            let threshold = step as f64 / 20.0;
            let ids: Vec<String> = match_apps("netflix", &apps, threshold)
                .into_iter()
                .map(|m| m.app_id)
                .collect();
            if let Some(prev) = &previous {
                assert!(ids.iter().all(|id| prev.contains(id)), "threshold {threshold}");
            }
            previous = Some(ids);
        }
    }

    #[test]
    fn resolves_app_launch_from_catalog() {
        let apps = catalog(&[("com.netflix.ninja", "Netflix")]);
        match resolve_command("please open netflix", Some(&apps), DEFAULT_THRESHOLD) {
            Resolution::LaunchApp { app_id, matches } => {
                assert_eq!(app_id, "com.netflix.ninja");
                assert_eq!(matches.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn falls_through_to_static_commands() {
        let apps = catalog(&[("com.netflix.ninja", "Netflix")]);
        assert_eq!(
            resolve_command("volume up", Some(&apps), DEFAULT_THRESHOLD),
            Resolution::Command {
                phrase: "volume up".to_string(),
                action: Action::KeyEvent("24"),
            }
        );
        assert_eq!(
            resolve_command("please go home", None, DEFAULT_THRESHOLD),
            Resolution::Command {
                phrase: "home".to_string(),
                action: Action::KeyEvent("3"),
            }
        );
    }

    #[test]
    fn no_match_distinguishes_unloaded_catalog() {
        let apps = catalog(&[("com.netflix.ninja", "Netflix")]);
        assert_eq!(
            resolve_command("open spotify", Some(&apps), DEFAULT_THRESHOLD),
            Resolution::NoMatch {
                extracted: "spotify".to_string(),
                catalog_loaded: true,
            }
        );
        assert_eq!(
            resolve_command("open spotify", None, DEFAULT_THRESHOLD),
            Resolution::NoMatch {
                extracted: "spotify".to_string(),
                catalog_loaded: false,
            }
        );
    }
}
