use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use objloader_types::Item;
use tokio::sync::mpsc;

use crate::error::LoadResult;

/// The loader's output: Items in dependency order, each after everything in
/// its closure. Failed ids show up as `Err` entries without ending the
/// stream. The stream ends once the loader has finished and drained.
#[derive(Debug)]
pub struct ItemStream {
    rx: mpsc::UnboundedReceiver<LoadResult<Item>>,
}

impl ItemStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<LoadResult<Item>>) -> Self {
        Self { rx }
    }

    pub(crate) fn into_inner(self) -> mpsc::UnboundedReceiver<LoadResult<Item>> {
        self.rx
    }
}

impl Stream for ItemStream {
    type Item = LoadResult<Item>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
