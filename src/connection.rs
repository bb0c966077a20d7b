use crate::catalog::AccessCode;
use crate::modbus::{Codec, ModbusRTUCodec, ModbusTCPCodec, Request, Response};
use crate::profile::{LinkSettings, Parity, Profile};
use futures::{SinkExt as _, StreamExt as _};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_serial::SerialStream;
use tokio_util::codec::Framed;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, trace, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("could not open the serial port {1:?}")]
    OpenSerial(#[source] tokio_serial::Error, PathBuf),
    #[error("could not send out the request")]
    Send(#[source] std::io::Error),
    #[error("could not read data from the stream")]
    Receive(#[source] std::io::Error),
    #[error("the device closed the connection")]
    Closed,
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("the device responded with modbus exception code {0}")]
    Exception(u8),
    #[error("the device returned {actual} registers, {expected} were requested")]
    ResponseLength { expected: u16, actual: usize },
    #[error("the device responded with unexpected function code {0}")]
    UnexpectedFunction(u8),
    #[error("the connection worker has stopped")]
    WorkerGone,
}

/// Something that can read a span of registers from the device.
pub trait RegisterReader: Send + Sync {
    fn read_registers(
        &self,
        start: u16,
        count: u16,
        access: AccessCode,
    ) -> impl Future<Output = Result<Vec<u16>, Error>> + Send;
}

#[derive(clap::Parser, Clone)]
#[group(id = "connection::Args")]
pub struct Args {
    #[clap(flatten)]
    how: ConnectionGroup,

    /// The modbus device ID. Defaults to the one from the device profile.
    #[arg(long, short = 'i')]
    device_id: Option<u8>,

    /// The baudrate of the serial line. Defaults to the one from the device profile.
    ///
    /// Also used to pace requests sent over Modbus TCP gateways.
    #[arg(long)]
    baudrate: Option<u32>,

    /// Parity of the serial line. Defaults to the one from the device profile.
    #[arg(long, value_enum)]
    parity: Option<Parity>,

    /// If the modbus response isn't received in this amount of time plus the expected
    /// transmission time, consider the request failed.
    #[arg(long)]
    read_timeout: Option<humantime::Duration>,
}

#[derive(clap::Parser, Clone)]
#[group(required = true, multiple = false)]
pub struct ConnectionGroup {
    /// Connect to the device through a Modbus TCP gateway (`host:port`).
    #[arg(long)]
    tcp: Option<String>,
    /// Connect to the device over Serial Modbus RTU.
    ///
    /// Specify the path to the serial device.
    #[arg(long)]
    rtu: Option<PathBuf>,
}

impl Args {
    fn link_settings(&self, profile: &LinkSettings) -> LinkSettings {
        LinkSettings {
            baud_rate: self.baudrate.unwrap_or(profile.baud_rate),
            parity: self.parity.unwrap_or(profile.parity),
            response_timeout: self.read_timeout.map(Into::into).unwrap_or(profile.response_timeout),
            ..*profile
        }
    }

    fn endpoint(&self) -> Endpoint {
        match (&self.how.tcp, &self.how.rtu) {
            (Some(address), _) => Endpoint::Tcp(address.clone()),
            (None, Some(path)) => Endpoint::Rtu(path.clone()),
            (None, None) => unreachable!("clap requires one of `--tcp` or `--rtu`"),
        }
    }
}

enum Endpoint {
    Tcp(String),
    Rtu(PathBuf),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp(address) => write!(f, "tcp://{address}"),
            Endpoint::Rtu(path) => write!(f, "rtu:{}", path.display()),
        }
    }
}

enum Link {
    Tcp(Framed<TcpStream, ModbusTCPCodec>),
    Rtu(Framed<SerialStream, ModbusRTUCodec>),
}

struct Job {
    request: Request,
    reply: oneshot::Sender<Result<Vec<u16>, Error>>,
}

/// A handle to the task owning the link to the device.
///
/// Requests from any number of callers are queued and executed strictly one at a time, as the
/// bus does not support more than a single outstanding request.
pub struct Connection {
    jobs: mpsc::Sender<Job>,
    transaction_id_generator: AtomicU16,
    device_id: u8,
    #[allow(unused)] // exists for its drop handler
    worker: AbortOnDropHandle<()>,
}

impl Connection {
    /// Open the link to the device.
    ///
    /// The link is established eagerly so that configuration mistakes surface right away. Later
    /// failures drop the link and the next request reconnects.
    pub async fn new(args: &Args, profile: &Profile) -> Result<Self, Error> {
        let mut worker = Worker {
            endpoint: args.endpoint(),
            settings: args.link_settings(&profile.link),
            link: None,
        };
        worker.link = Some(worker.connect().await?);
        let (jobs, queue) = mpsc::channel(16);
        Ok(Self {
            jobs,
            transaction_id_generator: AtomicU16::new(0),
            device_id: args.device_id.unwrap_or(profile.device_id),
            worker: AbortOnDropHandle::new(tokio::task::spawn(worker.main_loop(queue))),
        })
    }

    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    fn new_transaction_id(&self) -> u16 {
        self.transaction_id_generator.fetch_add(1, Ordering::Relaxed)
    }
}

impl RegisterReader for Connection {
    fn read_registers(
        &self,
        start: u16,
        count: u16,
        access: AccessCode,
    ) -> impl Future<Output = Result<Vec<u16>, Error>> + Send {
        let request = Request {
            device_id: self.device_id,
            transaction_id: self.new_transaction_id(),
            access,
            address: start,
            count,
        };
        async move {
            let (reply, response) = oneshot::channel();
            self.jobs.send(Job { request, reply }).await.map_err(|_| Error::WorkerGone)?;
            response.await.map_err(|_| Error::WorkerGone)?
        }
    }
}

struct Worker {
    endpoint: Endpoint,
    settings: LinkSettings,
    link: Option<Link>,
}

impl Worker {
    async fn main_loop(mut self, mut jobs: mpsc::Receiver<Job>) {
        while let Some(Job { request, reply }) = jobs.recv().await {
            let result = self.transact(&request).await;
            if let Err(e) = &result {
                debug!(
                    message = "request failed",
                    address = request.address,
                    count = request.count,
                    error = (e as &dyn std::error::Error)
                );
            }
            // The caller may have given up waiting, that's fine.
            let _ = reply.send(result);
        }
        debug!(message = "all connection handles dropped, worker exiting");
    }

    async fn transact(&mut self, request: &Request) -> Result<Vec<u16>, Error> {
        let link = match self.link.take() {
            Some(link) => link,
            None => self.connect().await?,
        };
        let timeout = self.response_timeout(request);
        let (link, response) = match link {
            Link::Tcp(mut io) => {
                let response = exchange(&mut io, request, timeout).await;
                (Link::Tcp(io), response)
            }
            Link::Rtu(mut io) => {
                let response = exchange(&mut io, request, timeout).await;
                (Link::Rtu(io), response)
            }
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    message = "dropping the link, will reconnect on the next request",
                    endpoint = %self.endpoint,
                    error = (&e as &dyn std::error::Error)
                );
                return Err(e);
            }
        };
        self.link = Some(link);
        into_words(request, response)
    }

    /// The configured response timeout plus the time it takes to transmit the response.
    fn response_timeout(&self, request: &Request) -> Duration {
        let response_length = u64::from(request.expected_response_length());
        let characters_per_second = (self.settings.baud_rate / 10).max(1);
        self.settings.response_timeout
            + Duration::from_secs(response_length) / characters_per_second
    }

    async fn connect(&self) -> Result<Link, Error> {
        info!(message = "connecting...", endpoint = %self.endpoint);
        match &self.endpoint {
            Endpoint::Tcp(address) => {
                let addresses = tokio::net::lookup_host(address)
                    .await
                    .map_err(|e| Error::LookupHost(e, address.to_string()))?
                    .collect::<Vec<_>>();
                debug!(message = "resolved", ?addresses);
                let socket = TcpStream::connect(&*addresses)
                    .await
                    .map_err(|e| Error::Connect(e, address.to_string()))?;
                let nodelay_result = socket.set_nodelay(true);
                trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
                info!(message = "connected");
                Ok(Link::Tcp(Framed::new(socket, ModbusTCPCodec::default())))
            }
            Endpoint::Rtu(path) => {
                let settings = &self.settings;
                let builder = tokio_serial::new(path.to_string_lossy(), settings.baud_rate)
                    .data_bits(settings.data_bits)
                    .parity(settings.parity.into())
                    .stop_bits(settings.stop_bits)
                    .timeout(settings.response_timeout);
                let stream = SerialStream::open(&builder)
                    .map_err(|e| Error::OpenSerial(e, path.clone()))?;
                info!(message = "opened", baud_rate = settings.baud_rate);
                Ok(Link::Rtu(Framed::new(stream, ModbusRTUCodec::default())))
            }
        }
    }
}

async fn exchange<T, C>(
    io: &mut Framed<T, C>,
    request: &Request,
    timeout: Duration,
) -> Result<Response, Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
    C: Codec + Unpin,
{
    io.send(request).await.map_err(Error::Send)?;
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let next = tokio::time::timeout_at(deadline, io.next())
            .await
            .map_err(|_| Error::Timeout(timeout))?;
        let response = match next {
            None => return Err(Error::Closed),
            Some(response) => response.map_err(Error::Receive)?,
        };
        if response.transaction_id != request.transaction_id
            || response.device_id != request.device_id
        {
            debug!(
                message = "a response we were not expecting",
                transaction = response.transaction_id,
                device_id = response.device_id
            );
            continue;
        }
        return Ok(response);
    }
}

fn into_words(request: &Request, response: Response) -> Result<Vec<u16>, Error> {
    if let Some(code) = response.exception_code() {
        return Err(Error::Exception(code));
    }
    if response.function_code != request.access.function_code() {
        return Err(Error::UnexpectedFunction(response.function_code));
    }
    let words = response.words().unwrap_or_default();
    if words.len() != usize::from(request.count) {
        return Err(Error::ResponseLength { expected: request.count, actual: words.len() });
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::ResponseKind;
    use clap::Parser as _;

    fn request(count: u16) -> Request {
        Request { device_id: 20, transaction_id: 1, access: AccessCode::Holding, address: 3, count }
    }

    fn response(function_code: u8, kind: ResponseKind) -> Response {
        Response { device_id: 20, transaction_id: 1, function_code, kind }
    }

    #[test]
    fn words_from_response() {
        let ok = response(3, ResponseKind::Registers { values: vec![0x04, 0xD2, 0x00, 0x38] });
        assert_eq!(into_words(&request(2), ok).unwrap(), vec![1234, 56]);

        let short = response(3, ResponseKind::Registers { values: vec![0x04, 0xD2] });
        assert!(matches!(
            into_words(&request(2), short),
            Err(Error::ResponseLength { expected: 2, actual: 1 })
        ));

        let exception = response(0x83, ResponseKind::Exception(2));
        assert!(matches!(into_words(&request(2), exception), Err(Error::Exception(2))));

        let wrong = response(4, ResponseKind::Registers { values: vec![0, 1] });
        assert!(matches!(into_words(&request(1), wrong), Err(Error::UnexpectedFunction(4))));
    }

    #[test]
    fn timeout_accounts_for_transmission() {
        let worker = Worker {
            endpoint: Endpoint::Tcp("localhost:502".into()),
            settings: crate::profile::Profile::hpw300().unwrap().link,
            link: None,
        };
        // 9 bytes at 1920 characters per second, plus the 50ms response timeout.
        let timeout = worker.response_timeout(&request(2));
        assert_eq!(timeout, Duration::from_millis(50) + Duration::from_secs(9) / 1920);
    }

    #[test]
    fn arguments_override_the_profile() {
        let profile = crate::profile::Profile::hpw300().unwrap();
        let args = Args::try_parse_from([
            "test",
            "--rtu",
            "/dev/ttyS1",
            "--baudrate",
            "9600",
            "--parity",
            "none",
            "--read-timeout",
            "200ms",
        ])
        .unwrap();
        let link = args.link_settings(&profile.link);
        assert_eq!(link.baud_rate, 9600);
        assert_eq!(link.parity, Parity::None);
        assert_eq!(link.response_timeout, Duration::from_millis(200));
        assert_eq!(link.data_bits, profile.link.data_bits);
        assert!(matches!(args.endpoint(), Endpoint::Rtu(p) if p == PathBuf::from("/dev/ttyS1")));
    }

    #[test]
    fn exactly_one_transport() {
        assert!(Args::try_parse_from(["test"]).is_err());
        assert!(Args::try_parse_from(["test", "--tcp", "a:502", "--rtu", "/dev/ttyS0"]).is_err());
        assert!(Args::try_parse_from(["test", "--tcp", "a:502"]).is_ok());
    }
}
