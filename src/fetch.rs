//! Chunked file retrieval.
//!
//! A [`FileSource`] opens a path as a finite stream of byte chunks; the end of
//! the stream is `Ok(None)`, never an error. [`fetch_file`] concatenates the
//! chunks in arrival order.

use std::future::Future;
use std::path::PathBuf;

use anyhow::anyhow;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::{LibError, Result};

pub const CHUNK_SIZE: usize = 64 * 1024;

pub trait ChunkStream: Send {
    fn next_chunk(&mut self) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;
}

pub trait FileSource: Send + Sync {
    type Stream: ChunkStream;

    fn open(&self, path: &str) -> impl Future<Output = Result<Self::Stream>> + Send;
}

pub async fn fetch_file<F: FileSource>(source: &F, path: &str) -> Result<Vec<u8>> {
    let mut stream = source.open(path).await?;
    let mut bytes = Vec::new();
    let mut chunks = 0usize;
    while let Some(chunk) = stream.next_chunk().await? {
        chunks += 1;
        bytes.extend_from_slice(&chunk);
    }
    tracing::info!(path, chunks, bytes = bytes.len(), "file fetched");
    Ok(bytes)
}

/// Reads files from the local filesystem, optionally under a root directory.
#[derive(Debug, Clone, Default)]
pub struct LocalFileSource {
    root: Option<PathBuf>,
    chunk_size: usize,
}

impl LocalFileSource {
    pub fn new() -> Self {
        Self {
            root: None,
            chunk_size: CHUNK_SIZE,
        }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            chunk_size: CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(path),
            None => PathBuf::from(path),
        }
    }
}

pub struct LocalChunks {
    file: File,
    chunk_size: usize,
}

impl ChunkStream for LocalChunks {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < chunk.len() {
            let read = self
                .file
                .read(&mut chunk[filled..])
                .await
                .map_err(|err| LibError::transport("Failed to read file", anyhow!(err)))?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        if filled == 0 {
            return Ok(None);
        }
        chunk.truncate(filled);
        Ok(Some(chunk))
    }
}

impl FileSource for LocalFileSource {
    type Stream = LocalChunks;

    async fn open(&self, path: &str) -> Result<LocalChunks> {
        let resolved = self.resolve(path);
        let file = File::open(&resolved).await.map_err(|err| {
            LibError::transport(
                "Failed to open file",
                anyhow!("{}: {err}", resolved.display()),
            )
        })?;
        let chunk_size = if self.chunk_size == 0 {
            CHUNK_SIZE
        } else {
            self.chunk_size
        };
        Ok(LocalChunks { file, chunk_size })
    }
}

#[cfg(feature = "grpc")]
pub mod grpc {
    //! `xlsx.XlsxService` (see `proto/xlsx.proto`): a client that implements
    //! [`FileSource`] and a server that streams any other [`FileSource`].

    use std::convert::Infallible;
    use std::sync::Arc;

    use anyhow::anyhow;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;
    use tonic::body::BoxBody;
    use tonic::codec::{ProstCodec, Streaming};
    use tonic::codegen::http::uri::PathAndQuery;
    use tonic::codegen::{Body, BoxFuture, Context, Poll, Service, StdError, empty_body, http};
    use tonic::server::{NamedService, ServerStreamingService};
    use tonic::transport::{Channel, Endpoint};
    use tonic::{Code, Status};

    use super::{ChunkStream, FileSource};
    use crate::error::{LibError, Result};

    const SERVICE_NAME: &str = "xlsx.XlsxService";
    const GET_XLSX_DATA: &str = "/xlsx.XlsxService/GetXlsxData";
    const SEND_BUFFER: usize = 4;

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct GetXlsxRequest {
        #[prost(string, tag = "1")]
        pub file_path: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct XlsxDataChunk {
        #[prost(bytes = "vec", tag = "1")]
        pub chunk: Vec<u8>,
    }

    #[derive(Debug, Clone)]
    pub struct GrpcFileSource {
        channel: Channel,
    }

    impl GrpcFileSource {
        pub async fn connect(addr: &str) -> Result<Self> {
            let endpoint = Endpoint::from_shared(addr.to_string()).map_err(|err| {
                LibError::invalid("File server address is invalid", anyhow!("{addr}: {err}"))
            })?;
            let channel = endpoint.connect().await.map_err(|err| {
                LibError::transport("File server is unreachable", anyhow!("{addr}: {err}"))
            })?;
            tracing::info!(addr, "connected to file server");
            Ok(Self { channel })
        }

        pub fn from_channel(channel: Channel) -> Self {
            Self { channel }
        }
    }

    pub struct GrpcChunks {
        inner: Streaming<XlsxDataChunk>,
    }

    impl ChunkStream for GrpcChunks {
        async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
            let message = self.inner.message().await.map_err(status_error)?;
            Ok(message.map(|message| message.chunk))
        }
    }

    impl FileSource for GrpcFileSource {
        type Stream = GrpcChunks;

        async fn open(&self, path: &str) -> Result<GrpcChunks> {
            let mut client = tonic::client::Grpc::new(self.channel.clone());
            client.ready().await.map_err(|err| {
                LibError::transport("File server is not ready", anyhow!(err))
            })?;
            let request = tonic::Request::new(GetXlsxRequest {
                file_path: path.to_string(),
            });
            let response = client
                .server_streaming(
                    request,
                    PathAndQuery::from_static(GET_XLSX_DATA),
                    ProstCodec::default(),
                )
                .await
                .map_err(status_error)?;
            Ok(GrpcChunks {
                inner: response.into_inner(),
            })
        }
    }

    /// Serves `GetXlsxData` from a [`FileSource`], one gRPC message per chunk.
    ///
    /// A path the source cannot open is answered with `NOT_FOUND`; a read error
    /// part way ends the stream with `INTERNAL`.
    pub struct XlsxServiceServer<F> {
        source: Arc<F>,
    }

    impl<F> XlsxServiceServer<F> {
        pub fn new(source: F) -> Self {
            Self {
                source: Arc::new(source),
            }
        }
    }

    impl<F> Clone for XlsxServiceServer<F> {
        fn clone(&self) -> Self {
            Self {
                source: Arc::clone(&self.source),
            }
        }
    }

    impl<F> NamedService for XlsxServiceServer<F> {
        const NAME: &'static str = SERVICE_NAME;
    }

    struct GetXlsxData<F>(Arc<F>);

    impl<F> ServerStreamingService<GetXlsxRequest> for GetXlsxData<F>
    where
        F: FileSource + 'static,
        F::Stream: 'static,
    {
        type Response = XlsxDataChunk;
        type ResponseStream = ReceiverStream<std::result::Result<XlsxDataChunk, Status>>;
        type Future = BoxFuture<tonic::Response<Self::ResponseStream>, Status>;

        fn call(&mut self, request: tonic::Request<GetXlsxRequest>) -> Self::Future {
            let source = Arc::clone(&self.0);
            Box::pin(async move {
                let path = request.into_inner().file_path;
                let mut chunks = source.open(&path).await.map_err(|err| {
                    tracing::warn!(path = %path, error = %err, "file not served");
                    Status::not_found(format!("{path}: {err}"))
                })?;

                let (tx, rx) = mpsc::channel(SEND_BUFFER);
                tokio::spawn(async move {
                    let mut sent = 0usize;
                    loop {
                        let message = match chunks.next_chunk().await {
                            Ok(Some(chunk)) => Ok(XlsxDataChunk { chunk }),
                            Ok(None) => break,
                            Err(err) => {
                                tracing::error!(path = %path, error = %err, "file read failed");
                                Err(Status::internal(err.to_string()))
                            }
                        };
                        let failed = message.is_err();
                        if tx.send(message).await.is_err() || failed {
                            break;
                        }
                        sent += 1;
                    }
                    tracing::debug!(path = %path, chunks = sent, "file served");
                });
                Ok::<_, Status>(tonic::Response::new(ReceiverStream::new(rx)))
            })
        }
    }

    impl<F, B> Service<http::Request<B>> for XlsxServiceServer<F>
    where
        F: FileSource + 'static,
        F::Stream: 'static,
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        type Response = http::Response<BoxBody>;
        type Error = Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;

        fn poll_ready(
            &mut self,
            _cx: &mut Context<'_>,
        ) -> Poll<std::result::Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, request: http::Request<B>) -> Self::Future {
            if request.uri().path() != GET_XLSX_DATA {
                return Box::pin(async move { Ok(unimplemented_response()) });
            }
            let method = GetXlsxData(Arc::clone(&self.source));
            Box::pin(async move {
                let mut grpc = tonic::server::Grpc::new(ProstCodec::default());
                Ok(grpc.server_streaming(method, request).await)
            })
        }
    }

    fn unimplemented_response() -> http::Response<BoxBody> {
        let mut response = http::Response::new(empty_body());
        let headers = response.headers_mut();
        headers.insert(
            "grpc-status",
            http::HeaderValue::from(Code::Unimplemented as i32),
        );
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/grpc"),
        );
        response
    }

    pub(crate) fn status_error(status: Status) -> LibError {
        match status.code() {
            Code::NotFound | Code::InvalidArgument => LibError::invalid(
                "File server rejected the request",
                anyhow!("{}: {}", status.code(), status.message()),
            ),
            _ => LibError::transport(
                "File transfer failed",
                anyhow!("{}: {}", status.code(), status.message()),
            ),
        }
    }

    #[cfg(test)]
    mod tests {
        use prost::Message;
        use tokio::net::TcpListener;
        use tokio_stream::wrappers::TcpListenerStream;
        use tonic::transport::Server;

        use super::*;
        use crate::error::ErrorKind;
        use crate::fetch::{LocalFileSource, fetch_file};

        async fn spawn_server(source: LocalFileSource) -> String {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(
                Server::builder()
                    .add_service(XlsxServiceServer::new(source))
                    .serve_with_incoming(TcpListenerStream::new(listener)),
            );
            format!("http://{addr}")
        }

        #[tokio::test]
        async fn server_streams_chunks_that_reassemble_exactly() {
            let dir = tempfile::tempdir().unwrap();
            let content = (0..200_000u32).map(|n| (n % 253) as u8).collect::<Vec<_>>();
            std::fs::write(dir.path().join("calls.xlsx"), &content).unwrap();
            let addr =
                spawn_server(LocalFileSource::with_root(dir.path()).with_chunk_size(4096)).await;

            let client = GrpcFileSource::connect(&addr).await.unwrap();
            let mut stream = client.open("calls.xlsx").await.unwrap();
            let mut sizes = Vec::new();
            let mut received = Vec::new();
            while let Some(chunk) = stream.next_chunk().await.unwrap() {
                sizes.push(chunk.len());
                received.extend_from_slice(&chunk);
            }
            assert_eq!(sizes.len(), 49);
            assert!(sizes[..48].iter().all(|size| *size == 4096));
            assert_eq!(sizes[48], 200_000 - 48 * 4096);
            assert_eq!(received, content);

            assert_eq!(fetch_file(&client, "calls.xlsx").await.unwrap(), content);
        }

        #[tokio::test]
        async fn served_empty_file_ends_without_chunks() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("empty.xlsx"), b"").unwrap();
            let addr = spawn_server(LocalFileSource::with_root(dir.path())).await;

            let client = GrpcFileSource::connect(&addr).await.unwrap();
            assert!(fetch_file(&client, "empty.xlsx").await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn unknown_remote_path_is_invalid_input() {
            let dir = tempfile::tempdir().unwrap();
            let addr = spawn_server(LocalFileSource::with_root(dir.path())).await;

            let client = GrpcFileSource::connect(&addr).await.unwrap();
            let err = fetch_file(&client, "absent.xlsx").await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidInput);
            assert!(err.to_string().contains("absent.xlsx"));
        }

        #[test]
        fn request_uses_field_one() {
            let encoded = GetXlsxRequest {
                file_path: "a.xlsx".to_string(),
            }
            .encode_to_vec();
            assert_eq!(encoded, [0x0a, 6, b'a', b'.', b'x', b'l', b's', b'x']);
        }

        #[test]
        fn missing_file_is_invalid_input_and_outage_is_transport() {
            assert_eq!(
                status_error(Status::not_found("nope")).kind,
                ErrorKind::InvalidInput
            );
            assert_eq!(
                status_error(Status::unavailable("down")).kind,
                ErrorKind::Transport
            );
        }
    }
}
