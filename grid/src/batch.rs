//! Splits oversized key/value sequences into correlated-request-sized chunks.
//!
//! Requests carrying more than `max-message-keys` keys or `max-message-values` values are
//! split by the caller (here: the endpoint) into a streaming sequence of chunks, each sent
//! as its own correlated request.

/// Yields `(keys_chunk, values_chunk)` pairs covering all of `keys`/`values`. `values` is
/// either empty (key-only requests) or the same length as `keys` (one value per key).
pub fn chunks<'a>(
    keys: &'a [Vec<u8>],
    values: &'a [Vec<u8>],
    max_keys: usize,
    max_values: usize,
) -> impl Iterator<Item = (&'a [Vec<u8>], &'a [Vec<u8>])> {
    let paired = !values.is_empty();
    let chunk_size = if paired {
        max_keys.max(1).min(max_values.max(1))
    } else {
        max_keys.max(1)
    };

    let len = keys.len();
    (0..len).step_by(chunk_size).map(move |start| {
        let end = (start + chunk_size).min(len);
        let values_chunk: &'a [Vec<u8>] = if paired { &values[start..end] } else { &[] };
        (&keys[start..end], values_chunk)
    })
}
