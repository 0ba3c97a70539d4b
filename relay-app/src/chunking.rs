//! Splits assistant replies into platform-sized messages.

/// Splits `reply` at exact `limit`-character boundaries. Every chunk after the
/// first is prefixed with `(i/total) `. A zero limit is treated as 1.
pub fn chunk(reply: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let chars: Vec<char> = reply.chars().collect();
    if chars.len() <= limit {
        return vec![reply.to_string()];
    }

    let total = chars.len().div_ceil(limit);
    chars
        .chunks(limit)
        .enumerate()
        .map(|(idx, body)| {
            let body: String = body.iter().collect();
            if idx == 0 {
                body
            } else {
                format!("({}/{total}) {body}", idx + 1)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip_prefix(idx: usize, total: usize, chunk: &str) -> &str {
        if idx == 0 {
            return chunk;
        }
        chunk
            .strip_prefix(&format!("({}/{total}) ", idx + 1))
            .expect("continuation chunk carries its marker")
    }

    #[test]
    fn short_reply_is_a_single_unprefixed_chunk() {
        assert_eq!(chunk("hello", 2000), vec!["hello".to_string()]);
        assert_eq!(chunk(&"x".repeat(10), 10), vec!["x".repeat(10)]);
        assert_eq!(chunk("", 10), vec![String::new()]);
    }

    #[test]
    fn long_reply_splits_with_markers_and_reassembles() {
        let reply: String = (0..4_500).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let chunks = chunk(&reply, 2_000);
        assert_eq!(chunks.len(), 3);
        assert!(!chunks[0].starts_with('('));
        assert!(chunks[1].starts_with("(2/3) "));
        assert!(chunks[2].starts_with("(3/3) "));

        let bodies: Vec<&str> = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| strip_prefix(i, chunks.len(), c))
            .collect();
        assert_eq!(bodies[0].chars().count(), 2_000);
        assert_eq!(bodies[1].chars().count(), 2_000);
        assert_eq!(bodies[2].chars().count(), 500);
        assert_eq!(bodies.concat(), reply);
    }

    #[test]
    fn chunk_count_is_ceiling_of_length_over_limit() {
        for (len, limit) in [(11, 10), (20, 10), (21, 10), (1_901, 1_900), (7, 1)] {
            let reply = "z".repeat(len);
            let chunks = chunk(&reply, limit);
            assert_eq!(chunks.len(), len.div_ceil(limit), "len={len} limit={limit}");
            let rebuilt: String = chunks
                .iter()
                .enumerate()
                .map(|(i, c)| strip_prefix(i, chunks.len(), c))
                .collect();
            assert_eq!(rebuilt, reply);
        }
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let reply = "日本語テキスト".repeat(3);
        let chunks = chunk(&reply, 5);
        let rebuilt: String = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| strip_prefix(i, chunks.len(), c))
            .collect();
        assert_eq!(rebuilt, reply);
        assert_eq!(chunks[0].chars().count(), 5);
    }

    #[test]
    fn chunking_is_deterministic() {
        let reply = "abc".repeat(50);
        assert_eq!(chunk(&reply, 7), chunk(&reply, 7));
    }

    #[test]
    fn zero_limit_behaves_like_one() {
        assert_eq!(chunk("ab", 0), vec!["a".to_string(), "(2/2) b".to_string()]);
    }
}
