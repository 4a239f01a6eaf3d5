/// Heuristic token estimation at a quarter token per character. Good enough
/// for budget reservations and context-window guard rails; the ledger
/// tolerates the resulting slack.
pub fn est_tokens(text: &str) -> usize {
    text.len() / 4
}

/// Greedily partition `items` into batches whose estimated token total stays
/// at or below `max_tokens_per_batch`. An oversized single item still gets
/// its own batch.
pub fn batch_by_tokens<'a>(items: &[&'a str], max_tokens_per_batch: usize) -> Vec<Vec<&'a str>> {
    let mut batches: Vec<Vec<&str>> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_tokens = 0usize;

    for item in items {
        let tokens = est_tokens(item);
        if current_tokens + tokens > max_tokens_per_batch && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current.push(item);
        current_tokens += tokens;
    }

    if !current.is_empty() {
        batches.push(current);
    }

    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_quarter_token_per_char() {
        assert_eq!(est_tokens(""), 0);
        assert_eq!(est_tokens("abcd"), 1);
        assert_eq!(est_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn batches_respect_token_budget() {
        let a = "a".repeat(400); // 100 tokens
        let b = "b".repeat(400);
        let c = "c".repeat(400);
        let items = vec![a.as_str(), b.as_str(), c.as_str()];

        let batches = batch_by_tokens(&items, 200);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
    }

    #[test]
    fn oversized_item_gets_own_batch() {
        let big = "x".repeat(4_000); // 1000 tokens
        let small = "y".repeat(40);
        let items = vec![small.as_str(), big.as_str(), small.as_str()];

        let batches = batch_by_tokens(&items, 100);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1].len(), 1);
    }
}
