//! Per-page fan-out and ordered fan-in.
//!
//! Pages are rendered by a bounded pool and may finish in any order; the
//! bundle is always assembled in page-index order.

use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::future::Future;
use std::io::{Cursor, Write};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::{ConvertError, ConvertedFile};

/// Upper bound on pages rendered at once for a single job.
pub const DEFAULT_PAGE_CONCURRENCY: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    /// 1-based page number.
    pub index: usize,
    pub bytes: Bytes,
}

/// Renders pages `1..=page_count` with at most `concurrency` in flight.
///
/// The first failing page aborts the whole render; pages still in flight
/// are dropped.
pub async fn render_pages<F, Fut>(
    page_count: usize,
    concurrency: usize,
    render: F,
) -> Result<Vec<RenderedPage>, ConvertError>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Result<Bytes, ConvertError>>,
{
    let mut pages: Vec<RenderedPage> = stream::iter(1..=page_count)
        .map(|index| {
            let page = render(index);
            async move { page.await.map(|bytes| RenderedPage { index, bytes }) }
        })
        .buffer_unordered(concurrency.max(1))
        .try_collect()
        .await?;

    pages.sort_by_key(|page| page.index);
    Ok(pages)
}

/// Name of the `index`th page image inside a bundle.
pub fn page_filename(stem: &str, index: usize) -> String {
    format!("{}_{}.png", stem, index)
}

/// Packs rendered PNG pages: a single page is returned as-is, several are
/// zipped in the order given.
pub fn bundle_pages(stem: &str, mut pages: Vec<RenderedPage>) -> Result<ConvertedFile, ConvertError> {
    match pages.len() {
        0 => Err(ConvertError::NoPages),
        1 => {
            let page = pages.remove(0);
            Ok(ConvertedFile::new(page.bytes, format!("{}.png", stem), "image/png"))
        }
        _ => {
            let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
            let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
            for page in &pages {
                writer
                    .start_file(page_filename(stem, page.index), options)
                    .map_err(|e| ConvertError::Bundle(e.to_string()))?;
                writer.write_all(&page.bytes)?;
            }
            let archive = writer
                .finish()
                .map_err(|e| ConvertError::Bundle(e.to_string()))?
                .into_inner();
            Ok(ConvertedFile::new(
                archive,
                format!("{}_pages.zip", stem),
                "application/zip",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_out_of_order_completion_is_reordered() {
        // later pages finish first
        let pages = render_pages(7, DEFAULT_PAGE_CONCURRENCY, |index| async move {
            tokio::time::sleep(Duration::from_millis(5 * (8 - index) as u64)).await;
            Ok(Bytes::from(format!("page-{}", index)))
        })
        .await
        .unwrap();

        let indices: Vec<usize> = pages.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(pages[3].bytes, Bytes::from("page-4"));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let pages = render_pages(20, 5, |index| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(Bytes::from(vec![index as u8]))
            }
        })
        .await
        .unwrap();

        assert_eq!(pages.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 5);
        assert!(peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_failed_page_fails_render() {
        let result = render_pages(4, 2, |index| async move {
            if index == 3 {
                Err(ConvertError::NoPages)
            } else {
                Ok(Bytes::from_static(b"ok"))
            }
        })
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_single_page_is_returned_raw() {
        let file = bundle_pages(
            "report",
            vec![RenderedPage {
                index: 1,
                bytes: Bytes::from_static(b"\x89PNG"),
            }],
        )
        .unwrap();

        assert_eq!(file.filename, "report.png");
        assert_eq!(file.content_type, "image/png");
        assert_eq!(file.bytes, Bytes::from_static(b"\x89PNG"));
    }

    #[test]
    fn test_zip_entries_follow_page_order() {
        let pages = (1..=3)
            .map(|index| RenderedPage {
                index,
                bytes: Bytes::from(format!("png-{}", index)),
            })
            .collect();
        let file = bundle_pages("report", pages).unwrap();
        assert_eq!(file.filename, "report_pages.zip");
        assert_eq!(file.content_type, "application/zip");

        let mut archive = zip::ZipArchive::new(Cursor::new(file.bytes.to_vec())).unwrap();
        assert_eq!(archive.len(), 3);
        for i in 0..3 {
            let mut entry = archive.by_index(i).unwrap();
            assert_eq!(entry.name(), page_filename("report", i + 1));
            let mut content = String::new();
            entry.read_to_string(&mut content).unwrap();
            assert_eq!(content, format!("png-{}", i + 1));
        }
    }

    #[test]
    fn test_no_pages_is_an_error() {
        assert!(matches!(
            bundle_pages("empty", Vec::new()),
            Err(ConvertError::NoPages)
        ));
    }
}
