use rayon::ThreadPool;
use std::sync::OnceLock;

/// Crate-local Rayon pool used for extract parsing.
///
/// Global pool initialization can fail under heavy resource pressure and Rayon
/// then panics on first use. A local pool lets parsing fall back to a single
/// thread instead.
static RAYON_POOL: OnceLock<Option<ThreadPool>> = OnceLock::new();

/// Threads available to parsing workers (`RAYON_NUM_THREADS` wins when set).
pub fn available_workers() -> usize {
    let from_env = std::env::var("RAYON_NUM_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|&n| n > 0);
    from_env.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    })
}

fn build_rayon_pool() -> Option<ThreadPool> {
    let requested = available_workers().max(1);
    let try_build = |n| {
        rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .thread_name(|i| format!("regstat-parse-{i}"))
            .build()
    };

    match try_build(requested) {
        Ok(pool) => Some(pool),
        Err(_) if requested > 1 => try_build(1).ok(),
        Err(_) => None,
    }
}

/// Returns the crate-local Rayon thread pool, if one could be created.
pub(crate) fn rayon_pool() -> Option<&'static ThreadPool> {
    RAYON_POOL.get_or_init(build_rayon_pool).as_ref()
}
