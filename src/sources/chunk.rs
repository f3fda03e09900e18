//! Id chunking under the batch-size and URL-length constraints.

use tracing::warn;

/// Split `ids` into chunks of at most `batch_size` whose concrete GET URL
/// (as measured by `url_len`) fits `max_url_length`. Oversized chunks split
/// recursively at the midpoint; a single id that still exceeds the limit is
/// logged and sent alone.
pub fn chunk_ids<F>(
    ids: &[String],
    batch_size: usize,
    max_url_length: usize,
    url_len: F,
) -> Vec<Vec<String>>
where
    F: Fn(&[String]) -> usize,
{
    let mut chunks: Vec<Vec<String>> = Vec::new();
    for chunk in ids.chunks(batch_size.max(1)) {
        split_to_fit(chunk, max_url_length, &url_len, &mut chunks);
    }
    chunks
}

fn split_to_fit<F>(
    chunk: &[String],
    max_url_length: usize,
    url_len: &F,
    out: &mut Vec<Vec<String>>,
) where
    F: Fn(&[String]) -> usize,
{
    if chunk.is_empty() {
        return;
    }
    if url_len(chunk) <= max_url_length {
        out.push(chunk.to_vec());
        return;
    }
    if chunk.len() == 1 {
        warn!(
            id = %chunk[0],
            url_length = url_len(chunk),
            max_url_length,
            "id exceeds URL length limit, sending alone"
        );
        out.push(chunk.to_vec());
        return;
    }
    let mid = chunk.len() / 2;
    split_to_fit(&chunk[..mid], max_url_length, url_len, out);
    split_to_fit(&chunk[mid..], max_url_length, url_len, out);
}

/// URL length estimator for comma-joined `filter_param` queries.
pub fn comma_filter_len<'a>(base: &'a str, filter_param: &'a str) -> impl Fn(&[String]) -> usize + 'a {
    move |ids: &[String]| {
        let joined: usize = ids.iter().map(String::len).sum::<usize>() + ids.len().saturating_sub(1);
        base.len() + 1 + filter_param.len() + 1 + joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("CHEMBL{i:04}")).collect()
    }

    #[test]
    fn test_batch_size_respected() {
        let chunks = chunk_ids(&ids(25), 10, usize::MAX, |_| 0);
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
    }

    #[test]
    fn test_midpoint_split_until_url_fits() {
        // Each id is 10 chars; pretend every id costs 10 URL chars.
        let estimate = |chunk: &[String]| chunk.len() * 10;
        let chunks = chunk_ids(&ids(8), 8, 25, estimate);
        assert!(chunks.iter().all(|c| estimate(c) <= 25));
        let total: usize = chunks.iter().map(Vec::len).sum();
        assert_eq!(total, 8);
    }

    #[test]
    fn test_oversize_singleton_sent_alone() {
        let estimate = |chunk: &[String]| chunk.len() * 100;
        let chunks = chunk_ids(&ids(2), 2, 50, estimate);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == 1));
    }

    #[test]
    fn test_comma_filter_len_counts_separators() {
        let estimate = comma_filter_len("http://api/activity.json", "activity_id__in");
        let two = vec!["123".to_string(), "456".to_string()];
        // base + '?' + param + '=' + "123,456"
        assert_eq!(
            estimate(&two),
            "http://api/activity.json".len() + 1 + "activity_id__in".len() + 1 + 7
        );
    }
}
