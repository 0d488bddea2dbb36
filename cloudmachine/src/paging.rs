//! Lazy pagination over continuation-token APIs.

use crate::common::CloudMachineResult;
use futures::stream::{self, BoxStream, StreamExt};
use std::future::Future;

/// One page of results and the token for the next page, if any.
pub type Page<T> = (Vec<T>, Option<String>);

enum PagerState {
    Start,
    Next(String),
    Done,
}

/// Flattens a page-fetching function into a stream of items.
///
/// Pages are requested only as the stream is consumed. The stream ends after
/// the first page without a continuation token, or after the first error.
/// It cannot be restarted; call the producing operation again for a fresh
/// listing.
pub fn paged<T, F, Fut>(mut fetch: F) -> BoxStream<'static, CloudMachineResult<T>>
where
    T: Send + 'static,
    F: FnMut(Option<String>) -> Fut + Send + 'static,
    Fut: Future<Output = CloudMachineResult<Page<T>>> + Send + 'static,
{
    stream::unfold(PagerState::Start, move |state| {
        let request = match state {
            PagerState::Start => Some(fetch(None)),
            PagerState::Next(token) => Some(fetch(Some(token))),
            PagerState::Done => None,
        };
        async move {
            match request?.await {
                Ok((items, next)) => {
                    let next_state = match next {
                        Some(token) if !token.is_empty() => PagerState::Next(token),
                        _ => PagerState::Done,
                    };
                    let items: Vec<CloudMachineResult<T>> = items.into_iter().map(Ok).collect();
                    Some((items, next_state))
                }
                Err(e) => Some((vec![Err(e)], PagerState::Done)),
            }
        }
    })
    .flat_map(stream::iter)
    .boxed()
}
