use crate::constants::{
    DES_KEY_LEN, RXKAD_SECURITY_INDEX, RXKAD_TKT_TYPE_KERBEROS_V5, RXRPC_KEY_VERSION,
};
use crate::crypto::derive_des_key;
use crate::error::KafsError;

use binrw::{binread, binwrite, BinWriterExt};
use std::time::SystemTime;
use tracing::{debug, error, instrument};

/// The parts of a Kerberos service ticket that an rxkad token is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTicket {
    pub enctype: i32,
    pub session_key: Vec<u8>,
    pub end_time: SystemTime,
    /// The DER encoded ticket, exactly as the KDC issued it.
    pub ticket: Vec<u8>,
}

/// The payload of an `rxrpc` key, in the layout the kernel's rxrpc key parser
/// expects. All integers are host endian.
#[binwrite]
#[binread]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPayload {
    pub version: u32,
    pub security_index: u16,
    #[bw(try_calc(u16::try_from(ticket.len())))]
    ticket_len: u16,
    pub expiry: u32,
    pub kvno: u32,
    pub session_key: [u8; DES_KEY_LEN],
    #[br(count = ticket_len)]
    pub ticket: Vec<u8>,
}

impl TokenPayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>, KafsError> {
        let mut c = std::io::Cursor::new(Vec::with_capacity(20 + self.ticket.len()));
        c.write_ne(self).map_err(|binrw_err| {
            error!(?binrw_err, "Unable to write token payload");
            KafsError::BinRWError
        })?;
        Ok(c.into_inner())
    }
}

/// Convert a service ticket for `afs/<cell>` into the rxrpc key payload that grants
/// the kernel access to that cell.
///
/// The expiry is the ticket end time in seconds since the epoch, truncated to 32
/// bits. AFS tokens cannot carry anything wider, so an end time past 2106 wraps.
#[instrument(level = "debug", skip(ticket))]
pub fn ticket_to_token(cell: &str, ticket: &ServiceTicket) -> Result<TokenPayload, KafsError> {
    if ticket.ticket.len() > u16::MAX as usize {
        error!(ticket_len = ticket.ticket.len(), "ticket does not fit in an rxrpc key");
        return Err(KafsError::TicketTooLarge);
    }

    let session_key = derive_des_key(ticket.enctype, &ticket.session_key)?;

    let expiry = ticket
        .end_time
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_err(|_| KafsError::DoYouHaveATimeMachine)?
        .as_secs() as u32;

    debug!(enctype = ticket.enctype, ?expiry, "built rxkad token");

    Ok(TokenPayload {
        version: RXRPC_KEY_VERSION,
        security_index: RXKAD_SECURITY_INDEX,
        expiry,
        kvno: RXKAD_TKT_TYPE_KERBEROS_V5,
        session_key,
        ticket: ticket.ticket.clone(),
    })
}
