//! Inserts many jobs over one dedicated connection.
use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::config::Config;
use crate::connection::{DEFAULT_TUBE, MAX_JOB_SIZE};
use crate::error::{Error, Result};
use crate::parser::validate_tube_name;
use crate::reader::ResponseReader;
use crate::types::job::JobId;
use crate::types::protocol::{BeanstalkCommand, ResponseLine};
use crate::types::serialisable::BeanstalkSerialisable;

pub struct BulkProducer {
    config: Config,
}

impl BulkProducer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Puts every item of `items` into `tube` (`default` if empty), sharing
    /// `pri`, `delay` and `ttr`.
    ///
    /// Returns one entry per item, in order: the new job's ID, or `None` if
    /// the server refused it as too big or because it's draining. Items over
    /// [`MAX_JOB_SIZE`] are refused without being sent. Any other response
    /// fails the whole batch.
    #[instrument(err, fields(%tube), skip_all)]
    pub async fn put<I>(
        &self,
        tube: &str,
        items: I,
        pri: u32,
        delay: u32,
        ttr: u32,
    ) -> Result<Vec<Option<JobId>>>
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
    {
        let commands: Vec<Option<BeanstalkCommand>> = items
            .into_iter()
            .map(Into::into)
            .map(|data: Bytes| {
                (data.len() <= MAX_JOB_SIZE).then_some(BeanstalkCommand::Put {
                    pri,
                    delay,
                    ttr,
                    data,
                })
            })
            .collect();
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let tube = if tube.is_empty() { DEFAULT_TUBE } else { tube };
        validate_tube_name(tube)?;

        let addr = self.config.addr();
        let connect = TcpStream::connect(&addr);
        let stream = timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| {
                Error::Connection(format!("timed out connecting to {addr}"))
            })??;
        stream.set_nodelay(true)?;

        let (r, w) = stream.into_split();
        let mut reader: ResponseReader<_> = r.into();
        let mut writer = BufWriter::new(w);

        let use_tube = BeanstalkCommand::Use {
            tube: tube.to_owned(),
        };
        writer.write_all(&use_tube.serialise_beanstalk()).await?;
        writer.flush().await?;
        match reader.read_response(&use_tube).await?.line {
            ResponseLine::Using { tube: using } if using == tube => {},
            other => {
                return Err(Error::UnexpectedResponse(format!("{other:?}")));
            },
        }

        // Responses are read while the puts are still being written, so a
        // large batch can't fill both socket buffers and stall.
        let write = async {
            for command in commands.iter().flatten() {
                writer.write_all(&command.serialise_beanstalk()).await?;
            }
            writer.flush().await?;
            Ok::<_, Error>(())
        };

        let read = async {
            let mut ids = Vec::with_capacity(commands.len());
            for command in &commands {
                let Some(command) = command else {
                    ids.push(None);
                    continue;
                };

                let id = match reader.read_response(command).await?.line {
                    ResponseLine::Inserted { id }
                    | ResponseLine::BuriedId { id } => Some(id),
                    ResponseLine::JobTooBig | ResponseLine::Draining => None,
                    other => {
                        return Err(Error::UnexpectedResponse(format!(
                            "{other:?}"
                        )));
                    },
                };
                ids.push(id);
            }
            Ok::<_, Error>(ids)
        };

        let ((), ids) = tokio::try_join!(write, read)?;

        debug!(
            sent = ids.len(),
            inserted = ids.iter().flatten().count(),
            "bulk put complete"
        );

        Ok(ids)
    }
}
