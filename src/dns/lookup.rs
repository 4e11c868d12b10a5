use eyre::{
    bail,
    Result,
};
use hickory_proto::{
    op::{
        Message,
        MessageType,
        OpCode,
        Query,
    },
    rr::{
        Name,
        RecordType,
    },
};
use rsdns::{
    clients::{
        tokio::Client,
        ClientConfig,
    },
    records::{
        data::Txt,
        Class,
    },
};
use std::{
    net::{
        Ipv4Addr,
        SocketAddr,
    },
    str::FromStr as _,
    sync::atomic::{
        AtomicU16,
        Ordering,
    },
    time::Duration,
};
use tokio::{
    net::UdpSocket,
    time::{
        sleep,
        timeout,
    },
};

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_QUERY_ID: AtomicU16 = AtomicU16::new(1);

/// Waits until `nameserver` answers a TXT query for `fqdn` with `value`.
pub async fn wait_for_txt_record(
    nameserver: SocketAddr,
    fqdn: &str,
    value: &str,
    max_wait: Option<Duration>,
    step: Duration,
) -> Result<(), eyre::Error> {
    debug!(%nameserver, %fqdn, "Waiting for TXT record to propagate...");
    let start = std::time::Instant::now();

    loop {
        if let Some(max_wait) = max_wait {
            if start.elapsed() > max_wait {
                bail!("TXT record propagation timeout for {fqdn:?}");
            }
        }

        match resolve_txt(nameserver, fqdn).await {
            Ok(values) if values.iter().any(|it| it == value) => {
                info!("TXT record for {fqdn:?} propagated successfully");
                break;
            }
            Ok(values) => trace!(?values, "TXT record does not match yet"),
            Err(err) => trace!("TXT lookup failed: {err}"),
        }

        sleep(step).await;
    }

    Ok(())
}

/// All TXT values of `qname`, each with its character-strings concatenated.
pub async fn resolve_txt(nameserver: SocketAddr, qname: &str) -> rsdns::Result<Vec<String>> {
    debug!(%nameserver, ?qname, "TXT record lookup...");
    let config = ClientConfig::with_nameserver(nameserver);
    let mut client = Client::new(config).await?;
    let rrset = client.query_rrset::<Txt>(qname, Class::IN).await?;
    Ok(rrset
        .rdata
        .iter()
        .map(|txt| String::from_utf8_lossy(&txt.text).to_string())
        .collect())
}

/// Sends a single query for `qname` to `nameserver` over UDP and returns the raw reply.
///
/// Unlike [`resolve_txt`] this does not interpret the response code, so NXDOMAIN and SERVFAIL replies are
/// returned as is.
pub async fn exchange(nameserver: SocketAddr, qname: &str, ty: RecordType) -> Result<Message> {
    let name = Name::from_str(qname)?;
    let id = NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed);
    let mut query = Message::new(id, MessageType::Query, OpCode::Query);
    query.set_recursion_desired(true);
    query.add_query(Query::query(name, ty));

    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
    socket.send_to(&query.to_vec()?, nameserver).await?;

    let mut buf = vec![0u8; 4096];
    let len = match timeout(EXCHANGE_TIMEOUT, socket.recv(&mut buf)).await {
        Ok(received) => received?,
        Err(_) => bail!("no reply from {nameserver} for {qname:?} {ty}"),
    };

    let reply = Message::from_vec(&buf[..len])?;
    if reply.id() != id {
        bail!("reply id {} does not match query id {id}", reply.id());
    }
    Ok(reply)
}
