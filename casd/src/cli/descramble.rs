use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cas_core::constants::TS_PACKET_SIZE;
use cas_core::{
    CaidEntry, Dispatcher, PacketVerdict, Registry, ServiceInfo, des_ncb_factory_sized, ts,
};
use clap::Parser;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::clients::build_client;
use crate::config::Config;
use crate::ts_file::{EcmArg, SectionAssembler};

const KEY_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
pub struct DescrambleCommand {
    /// Configuration file (YAML)
    #[arg(short, long, default_value = "casd.yaml")]
    pub config: PathBuf,

    /// Scrambled transport stream
    #[arg(short, long)]
    pub input: PathBuf,

    /// Where to write the descrambled stream
    #[arg(short, long)]
    pub output: PathBuf,

    /// Service id
    #[arg(long)]
    pub sid: u16,

    /// Transport stream id
    #[arg(long)]
    pub tsid: u16,

    /// Original network id
    #[arg(long, default_value = "0")]
    pub onid: u16,

    /// Adapter number reported to the clients
    #[arg(long, default_value = "0")]
    pub adapter: u8,

    /// ECM stream as pid:caid[:provider], repeatable
    #[arg(long = "ecm", required = true)]
    pub ecms: Vec<EcmArg>,

    /// Seconds to wait for a key after each new ECM
    #[arg(long, default_value = "10")]
    pub key_timeout: u64,
}

#[derive(Debug, Default)]
struct Counters {
    packets: u64,
    sections: u64,
    dropped: u64,
}

impl DescrambleCommand {
    pub async fn run(self) -> Result<()> {
        let config = Config::load(&self.config)?;
        let registry = Arc::new(match config.cluster_size {
            Some(size) => Registry::with_cipher(des_ncb_factory_sized(size)),
            None => Registry::new(),
        });
        for client in config.clients {
            registry.add_client(build_client(client, registry.activity()))?;
        }
        let dispatcher = Dispatcher::new(Arc::clone(&registry));

        let output = File::create(&self.output)
            .await
            .with_context(|| format!("creating {}", self.output.display()))?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer = tokio::spawn(async move {
            let mut out = BufWriter::new(output);
            let mut written = 0u64;
            while let Some(tsb) = rx.recv().await {
                out.write_all(&tsb).await?;
                written += 1;
            }
            out.flush().await?;
            Ok::<_, std::io::Error>(written)
        });

        let caids: Vec<CaidEntry> = self
            .ecms
            .iter()
            .map(|e| CaidEntry::new(e.caid, e.pid, e.provider_id))
            .collect();
        let info = ServiceInfo {
            name: format!("sid {}", self.sid),
            service_id: self.sid,
            transport_stream_id: self.tsid,
            original_network_id: self.onid,
            adapter: self.adapter,
            pmt_pid: 0,
        };
        let service = dispatcher.service_started(
            info,
            caids,
            Box::new(move |tsb: &[u8]| {
                let _ = tx.send(tsb.to_vec());
            }),
        );

        let mut assemblers: HashMap<u16, SectionAssembler> = self
            .ecms
            .iter()
            .map(|e| (e.pid, SectionAssembler::new()))
            .collect();

        let input = File::open(&self.input)
            .await
            .with_context(|| format!("opening {}", self.input.display()))?;
        let mut reader = BufReader::new(input);
        let mut tsb = [0u8; TS_PACKET_SIZE];
        let mut counters = Counters::default();
        let mut waited_at = 0;
        let key_timeout = Duration::from_secs(self.key_timeout);

        loop {
            match reader.read_exact(&mut tsb).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e).context("reading input"),
            }
            counters.packets += 1;

            if let Err(e) = ts::check_packet(&tsb) {
                warn!(packet = counters.packets, error = %e, "skipping packet");
                counters.dropped += 1;
                continue;
            }

            let pid = ts::pid(&tsb);
            if let Some(assembler) = assemblers.get_mut(&pid) {
                for section in assembler.push(&tsb) {
                    counters.sections += 1;
                    dispatcher.on_table_section(&service, pid, &section);
                }
            }

            let mut verdict = dispatcher.on_packet(&service, &tsb);
            // Give the client one round trip per new ECM before dropping.
            if verdict == PacketVerdict::NeedKey
                && counters.sections > 0
                && waited_at != counters.sections
            {
                waited_at = counters.sections;
                let deadline = Instant::now() + key_timeout;
                while verdict == PacketVerdict::NeedKey && Instant::now() < deadline {
                    tokio::time::sleep(KEY_POLL_INTERVAL).await;
                    verdict = dispatcher.on_packet(&service, &tsb);
                }
            }
            if verdict != PacketVerdict::Pass {
                counters.dropped += 1;
            }
        }

        let status = service.feed_status();
        dispatcher.service_stopped(&service);
        drop(service);
        registry.shutdown().await;

        let written = writer.await.context("writer task")??;
        info!(
            packets = counters.packets,
            ecm_sections = counters.sections,
            dropped = counters.dropped,
            written,
            status = ?status,
            "descrambling finished"
        );

        Ok(())
    }
}
