//! Server-side HTML sanitizer for user-provided strings that end up rendered
//! in dashboards (order IDs, metadata values). Strips tags, `javascript:`/
//! `data:` schemes, and on-event attributes; applied to a fixpoint so a
//! nested malformed tag can't survive a single pass.

use ammonia::Builder;

/// Repeatedly sanitizes `input` until the output stops changing, so that
/// constructs like `<scr<script>ipt>` can't slip through after one pass
/// strips the inner tag and reassembles something live.
pub fn sanitize(input: &str) -> String {
    let mut current = input.to_string();
    loop {
        let cleaned = clean_once(&current);
        if cleaned == current {
            return cleaned;
        }
        current = cleaned;
    }
}

fn clean_once(input: &str) -> String {
    Builder::empty()
        .clean(input)
        .to_string()
}
