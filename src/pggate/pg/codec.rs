use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::debug;

use crate::pggate::{Error, Result};
use crate::pggate::pg::protocol::{
    Frame, Message, MessageBuilder, MessageParser, ServerParams, StartupRequest,
    Tag, PROTOCOL_VERSION,
};

/// Default user-space buffer size for reading protocol messages.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 8 * 1024;

/// Reads framed protocol messages off one half of a stream.
struct MessageInput<R> {
    stream: R,
    parser: MessageParser,
}

impl<R: AsyncRead + Unpin> MessageInput<R> {
    fn new(stream: R, recv_buffer_size: usize) -> Self {
        Self {
            stream,
            parser: MessageParser::new(recv_buffer_size),
        }
    }

    async fn next_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(result) = self.parser.next() {
                return result;
            }
            self.fill().await?;
        }
    }

    async fn next_startup(&mut self) -> Result<StartupRequest> {
        loop {
            if let Some(result) = self.parser.next_startup() {
                return StartupRequest::parse(&result?);
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<()> {
        let n = self.stream.read_buf(self.parser.bytes_mut()).await?;
        if n == 0 {
            return if self.parser.is_empty() {
                // EOF at a message boundary
                Err(Error::closed())
            } else {
                Err(Error::protocol_error("connection closed mid-message"))
            };
        }
        Ok(())
    }
}

/// Writes serialized messages to one half of a stream. Each write is the
/// complete encoding of one or more messages, so the counterparty never
/// observes a partial message from an interleaved writer.
struct MessageOutput<W> {
    stream: W,
}

impl<W: AsyncWrite + Unpin> MessageOutput<W> {
    fn new(stream: W) -> Self {
        Self { stream }
    }

    async fn write(&mut self, bytes: Bytes) -> Result<()> {
        self.stream.write_all(&bytes).await?;
        // a TLS stream buffers internally, push the ciphertext out
        self.stream.flush().await?;
        Ok(())
    }
}

/// The backend view of the wire: reads what the client sent, writes toward
/// the client.
pub struct BackendCodec<S> {
    input: MessageInput<ReadHalf<S>>,
    output: MessageOutput<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite> BackendCodec<S> {
    pub fn new(stream: S, recv_buffer_size: usize) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            input: MessageInput::new(r, recv_buffer_size),
            output: MessageOutput::new(w),
        }
    }

    /// Reads the untagged message a client opens the wire with.
    pub async fn receive_startup(&mut self) -> Result<StartupRequest> {
        let startup = self.input.next_startup().await?;
        debug!(%startup, "received startup");
        Ok(startup)
    }

    pub async fn receive(&mut self) -> Result<Message> {
        Message::decode_frontend(self.input.next_frame().await?)
    }

    pub async fn send(&mut self, msg: Message) -> Result<()> {
        self.output.write(msg.encode()).await
    }

    /// Sends a pre-serialized run of messages in one write.
    pub async fn send_bytes(&mut self, bytes: Bytes) -> Result<()> {
        self.output.write(bytes).await
    }

    /// Consumes the codec and yields the owned, non-clonable halves used
    /// by the relay: exactly one reader and one writer per direction.
    pub fn split(self) -> (BackendReader<S>, BackendWriter<S>) {
        (BackendReader { input: self.input }, BackendWriter { output: self.output })
    }
}

pub struct BackendReader<S> {
    input: MessageInput<ReadHalf<S>>,
}

impl<S: AsyncRead> BackendReader<S> {
    pub async fn receive(&mut self) -> Result<Message> {
        Message::decode_frontend(self.input.next_frame().await?)
    }
}

pub struct BackendWriter<S> {
    output: MessageOutput<WriteHalf<S>>,
}

impl<S: AsyncWrite> BackendWriter<S> {
    pub async fn send(&mut self, msg: Message) -> Result<()> {
        self.output.write(msg.encode()).await
    }
}

/// The frontend view of the wire: reads what the server sent, writes toward
/// the server.
pub struct FrontendCodec<S> {
    input: MessageInput<ReadHalf<S>>,
    output: MessageOutput<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite> FrontendCodec<S> {
    pub fn new(stream: S, recv_buffer_size: usize) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            input: MessageInput::new(r, recv_buffer_size),
            output: MessageOutput::new(w),
        }
    }

    /// Opens the wire with a startup message carrying the user, database
    /// and any runtime parameters.
    pub async fn send_startup(&mut self, user: &str, database: &str, params: &ServerParams) -> Result<()> {
        let mut mb = MessageBuilder::new(Tag::UNTAGGED);
        mb.write_i32(PROTOCOL_VERSION);
        mb.write_str("user");
        mb.write_str(user);
        mb.write_str("database");
        mb.write_str(database);
        mb.write_params(params);
        mb.write_byte(0); // terminates the parameter list
        self.output.write(mb.finish()).await
    }

    pub async fn receive(&mut self) -> Result<Message> {
        Message::decode_backend(self.input.next_frame().await?)
    }

    pub async fn send(&mut self, msg: Message) -> Result<()> {
        self.output.write(msg.encode()).await
    }

    pub fn split(self) -> (FrontendReader<S>, FrontendWriter<S>) {
        (FrontendReader { input: self.input }, FrontendWriter { output: self.output })
    }
}

pub struct FrontendReader<S> {
    input: MessageInput<ReadHalf<S>>,
}

impl<S: AsyncRead> FrontendReader<S> {
    pub async fn receive(&mut self) -> Result<Message> {
        Message::decode_backend(self.input.next_frame().await?)
    }
}

pub struct FrontendWriter<S> {
    output: MessageOutput<WriteHalf<S>>,
}

impl<S: AsyncWrite> FrontendWriter<S> {
    pub async fn send(&mut self, msg: Message) -> Result<()> {
        self.output.write(msg.encode()).await
    }
}
