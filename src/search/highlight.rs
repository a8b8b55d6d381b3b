//! Keyword highlighting for search results.
//!
//! Pure functions over text; nothing here touches the index. Byte offsets
//! returned by [`find_occurrences`] always fall on character boundaries of
//! the original text, so slicing with them is safe.

/// Half-open byte range `[start, end)` of one keyword occurrence.
pub type Range = (usize, usize);

/// A slice of the original text, marked or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSegment {
    pub text: String,
    pub highlighted: bool,
}

/// Locate every case-insensitive occurrence of each keyword. Occurrences
/// of one keyword never overlap each other (the scan resumes past a
/// match), but ranges from different keywords may; the output is
/// sanitized into a disjoint set.
pub fn find_occurrences(text: &str, keywords: &[String]) -> Vec<Range> {
    let lowered = text.to_lowercase();
    let mut positions: Vec<Range> = Vec::new();

    for keyword in keywords {
        let keyword = keyword.to_lowercase();
        if keyword.is_empty() {
            continue;
        }
        let mut start_from = 0;
        while let Some(found) = lowered[start_from..].find(&keyword) {
            let lowered_start = start_from + found;
            let lowered_end = lowered_start + keyword.len();
            // Lowercasing can change byte lengths (ẞ -> ß etc.), so map
            // offsets back onto the original text before recording them.
            if let Some(range) = map_to_original(text, &lowered, lowered_start, lowered_end) {
                positions.push(range);
            }
            start_from = lowered_end;
        }
    }

    sanitize_positions(positions)
}

/// Map a byte range in the lowercased text back to the original. When the
/// two strings have identical layout (the overwhelmingly common case) this
/// is the identity; otherwise fall back to a char-by-char walk.
fn map_to_original(
    original: &str,
    lowered: &str,
    lowered_start: usize,
    lowered_end: usize,
) -> Option<Range> {
    if original.len() == lowered.len() {
        if original.is_char_boundary(lowered_start) && original.is_char_boundary(lowered_end) {
            return Some((lowered_start, lowered_end));
        }
        return None;
    }

    let mut original_offset = 0;
    let mut start = None;
    let mut lowered_offset = 0;
    for ch in original.chars() {
        if lowered_offset == lowered_start {
            start = Some(original_offset);
        }
        if lowered_offset >= lowered_end {
            break;
        }
        lowered_offset += ch.to_lowercase().map(char::len_utf8).sum::<usize>();
        original_offset += ch.len_utf8();
    }
    if lowered_offset == lowered_start {
        start = Some(original_offset);
    }

    start.map(|s| (s, original_offset))
}

/// Sort ranges by start and merge any two where the next one begins at or
/// before the previous end. The result is sorted, pairwise disjoint, and
/// covers exactly the union of the input; applying it twice is a no-op.
pub fn sanitize_positions(mut positions: Vec<Range>) -> Vec<Range> {
    if positions.len() < 2 {
        return positions;
    }

    positions.sort_by_key(|&(start, _)| start);

    let mut result = Vec::with_capacity(positions.len());
    let mut previous = positions[0];
    for &(start, end) in &positions[1..] {
        if previous.1 >= start {
            previous.1 = previous.1.max(end);
        } else {
            result.push(previous);
            previous = (start, end);
        }
    }
    result.push(previous);

    result
}

/// Split `text` into alternating plain/highlighted segments per the given
/// disjoint sorted ranges. Empty plain segments between adjacent ranges
/// are dropped; with no ranges the single returned segment reproduces the
/// text exactly.
pub fn mark_text(text: &str, ranges: &[Range]) -> Vec<TextSegment> {
    if ranges.is_empty() {
        return vec![TextSegment {
            text: text.to_string(),
            highlighted: false,
        }];
    }

    let mut segments = Vec::with_capacity(ranges.len() * 2 + 1);
    let mut previous_end = 0;
    for &(start, end) in ranges {
        if start > previous_end {
            segments.push(TextSegment {
                text: text[previous_end..start].to_string(),
                highlighted: false,
            });
        }
        segments.push(TextSegment {
            text: text[start..end].to_string(),
            highlighted: true,
        });
        previous_end = end;
    }
    if previous_end < text.len() {
        segments.push(TextSegment {
            text: text[previous_end..].to_string(),
            highlighted: false,
        });
    }

    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keywords(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_find_occurrences_case_insensitive() {
        assert_eq!(
            find_occurrences("The Cat sat", &keywords(&["cat"])),
            vec![(4, 7)]
        );
    }

    #[test]
    fn test_find_occurrences_repeated_keyword() {
        assert_eq!(
            find_occurrences("cat catalog cat", &keywords(&["cat"])),
            vec![(0, 3), (4, 7), (12, 15)]
        );
    }

    #[test]
    fn test_find_occurrences_overlapping_keywords_merged() {
        // "cat" at 4..7 and "at s" at 5..9 overlap
        assert_eq!(
            find_occurrences("The Cat sat", &keywords(&["cat", "at s"])),
            vec![(4, 9)]
        );
    }

    #[test]
    fn test_sanitize_merges_overlap_and_adjacency() {
        assert_eq!(sanitize_positions(vec![(4, 7), (5, 9)]), vec![(4, 9)]);
        // Closed-interval adjacency merges too
        assert_eq!(sanitize_positions(vec![(0, 3), (3, 5)]), vec![(0, 5)]);
        // Disjoint ranges stay separate
        assert_eq!(
            sanitize_positions(vec![(6, 8), (0, 2)]),
            vec![(0, 2), (6, 8)]
        );
        // Containment collapses
        assert_eq!(sanitize_positions(vec![(0, 10), (2, 4)]), vec![(0, 10)]);
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let inputs = vec![
            vec![(4, 7), (5, 9), (20, 25), (24, 30), (1, 2)],
            vec![(0, 1)],
            vec![],
        ];
        for input in inputs {
            let once = sanitize_positions(input);
            let twice = sanitize_positions(once.clone());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_sanitize_preserves_union() {
        let input = vec![(4, 7), (5, 9), (12, 14), (14, 16), (1, 2)];
        let output = sanitize_positions(input.clone());

        let covered = |ranges: &[Range], point: usize| {
            ranges.iter().any(|&(s, e)| point >= s && point < e)
        };
        for point in 0..20 {
            assert_eq!(
                covered(&input, point),
                covered(&output, point),
                "coverage differs at {}",
                point
            );
        }
        // Pairwise disjoint and sorted
        for pair in output.windows(2) {
            assert!(pair[0].1 < pair[1].0);
        }
    }

    #[test]
    fn test_mark_text_identity_on_empty_ranges() {
        let text = "nothing to see here";
        let segments = mark_text(text, &[]);
        assert_eq!(segments.len(), 1);
        assert!(!segments[0].highlighted);
        assert_eq!(segments[0].text, text);
    }

    #[test]
    fn test_mark_text_alternates_and_reassembles() {
        let text = "The Cat sat on the mat";
        let ranges = find_occurrences(text, &keywords(&["cat", "mat"]));
        let segments = mark_text(text, &ranges);

        let reassembled: String = segments.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(reassembled, text);

        let marked: Vec<_> = segments
            .iter()
            .filter(|s| s.highlighted)
            .map(|s| s.text.as_str())
            .collect();
        assert_eq!(marked, vec!["Cat", "mat"]);
    }

    #[test]
    fn test_mark_text_leading_match() {
        let segments = mark_text("cat nap", &[(0, 3)]);
        assert_eq!(
            segments,
            vec![
                TextSegment {
                    text: "cat".into(),
                    highlighted: true
                },
                TextSegment {
                    text: " nap".into(),
                    highlighted: false
                },
            ]
        );
    }

    #[test]
    fn test_find_occurrences_non_ascii() {
        // Multibyte text around the match must not break offsets
        let text = "héllo CAT wörld";
        let ranges = find_occurrences(text, &keywords(&["cat"]));
        assert_eq!(ranges.len(), 1);
        let (start, end) = ranges[0];
        assert_eq!(&text[start..end], "CAT");
    }
}
