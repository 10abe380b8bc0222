use std::{
    io,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::{fs::File, io::AsyncReadExt};
use tracing::debug;
use walkdir::WalkDir;

use super::{HandlerError, HandlerResult, RouteHandler};
use crate::domain::{Route, payload_output_path};

const PAYLOAD_FILE: &str = "index.rsc";

/// Serves payloads previously written to a directory tree, one
/// `index.rsc` per route.
#[derive(Debug, Clone)]
pub struct PayloadDirectory {
    root: PathBuf,
    chunk_size: NonZeroUsize,
}

impl PayloadDirectory {
    pub fn new(root: impl Into<PathBuf>, chunk_size: NonZeroUsize) -> Self {
        Self {
            root: root.into(),
            chunk_size,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn payload_path(&self, route: &Route) -> PathBuf {
        payload_output_path(&self.root, route)
    }

    /// Every route with a payload file below the root, sorted.
    pub fn discover(&self) -> io::Result<Vec<Route>> {
        let mut routes = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(true) {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() || entry.file_name() != PAYLOAD_FILE {
                continue;
            }
            let Some(dir) = entry.path().parent() else {
                continue;
            };
            let Ok(relative) = dir.strip_prefix(&self.root) else {
                continue;
            };
            let segments: Vec<String> = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy().into_owned())
                .collect();
            match Route::parse(format!("/{}", segments.join("/"))) {
                Ok(route) => routes.push(route),
                Err(error) => debug!(
                    target = "prerender::routes::directory",
                    path = %entry.path().display(),
                    error = %error,
                    "Skipping payload with an invalid route"
                ),
            }
        }
        routes.sort();
        routes.dedup();
        Ok(routes)
    }
}

#[async_trait]
impl RouteHandler for PayloadDirectory {
    async fn handle(&self, route: &Route) -> HandlerResult {
        if route.is_dynamic() {
            return HandlerResult::skip("dynamic route has no static payload");
        }

        let path = self.payload_path(route);
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return HandlerResult::Failed(HandlerError::NotFound {
                    route: route.clone(),
                    path,
                });
            }
            Err(source) => return HandlerResult::Failed(HandlerError::Io { path, source }),
        };

        let chunk_size = self.chunk_size.get();
        let stream = try_stream! {
            let mut file = file;
            loop {
                let mut buffer = vec![0u8; chunk_size];
                let read = file
                    .read(&mut buffer)
                    .await
                    .map_err(|source| HandlerError::Io { path: path.clone(), source })?;
                if read == 0 {
                    break;
                }
                buffer.truncate(read);
                yield Bytes::from(buffer);
            }
        };
        HandlerResult::Payload(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;

    fn directory(root: &Path, chunk_size: usize) -> PayloadDirectory {
        PayloadDirectory::new(root, NonZeroUsize::new(chunk_size).unwrap())
    }

    fn write_payload(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[tokio::test]
    async fn payload_is_streamed_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        write_payload(dir.path(), "about/index.rsc", "0:\"hello world\"\n");

        let handler = directory(dir.path(), 4);
        let HandlerResult::Payload(stream) = handler.handle(&Route::parse("/about").unwrap()).await
        else {
            panic!("expected payload");
        };
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|chunk| chunk.len() <= 4));
        assert_eq!(chunks.concat(), b"0:\"hello world\"\n");
    }

    #[tokio::test]
    async fn missing_and_dynamic_routes() {
        let dir = tempfile::tempdir().unwrap();
        let handler = directory(dir.path(), 1024);

        let missing = handler.handle(&Route::parse("/missing").unwrap()).await;
        assert!(matches!(
            missing,
            HandlerResult::Failed(HandlerError::NotFound { .. })
        ));

        let dynamic = handler.handle(&Route::parse("/blog/[slug]").unwrap()).await;
        assert!(matches!(dynamic, HandlerResult::Skip { .. }));
    }

    #[test]
    fn discovers_routes_from_payload_files() {
        let dir = tempfile::tempdir().unwrap();
        write_payload(dir.path(), "index.rsc", "0:null\n");
        write_payload(dir.path(), "about/index.rsc", "0:null\n");
        write_payload(dir.path(), "blog/first/index.rsc", "0:null\n");
        write_payload(dir.path(), "blog/notes.txt", "ignored");

        let routes: Vec<String> = directory(dir.path(), 1024)
            .discover()
            .unwrap()
            .into_iter()
            .map(|route| route.to_string())
            .collect();

        assert_eq!(routes, vec!["/", "/about", "/blog/first"]);
    }
}
