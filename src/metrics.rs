use tracing::trace;

// Lightweight metrics helpers that stay safe when no recorder is installed
// (unit tests, offline runs).

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "pricebook.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "pricebook.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn chunk_processed(sheet: &str, chunk_index: usize, extracted: usize) {
    trace!(
        target = "pricebook.metrics",
        sheet = sheet,
        chunk_index = chunk_index,
        extracted = extracted,
        "chunk_processed"
    );
}
