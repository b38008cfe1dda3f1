//! Blocking client for the server protocol.

use std::collections::BTreeMap;
use std::io::{self, BufReader, BufWriter, Write};
use std::net::{TcpStream, ToSocketAddrs};

use thiserror::Error;

use crate::catalog::CollectionKind;
use crate::collections::{Key, KeyElement};
use crate::iterator::IterHandle;
use crate::protocol::{ProtocolError, Request, Response, read_message, write_message};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Server closed the connection")]
    Disconnected,

    /// The server rejected the request; the text is `<ErrorKind>: <message>`
    #[error("{0}")]
    Server(String),

    #[error("Unexpected response: {0:?}")]
    UnexpectedResponse(Response),
}

pub type ClientResult<T> = Result<T, ClientError>;

pub struct Client {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

macro_rules! expect_response {
    ($response:expr, $pattern:pat => $value:expr) => {
        match $response {
            $pattern => Ok($value),
            other => Err(ClientError::UnexpectedResponse(other)),
        }
    };
}

impl Client {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> ClientResult<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
        })
    }

    /// Send one request and wait for its response. Error responses are
    /// returned as responses, not as `Err`.
    pub fn request(&mut self, request: &Request) -> ClientResult<Response> {
        write_message(&mut self.writer, request)?;
        self.writer.flush()?;
        read_message(&mut self.reader)?.ok_or(ClientError::Disconnected)
    }

    fn call(&mut self, request: Request) -> ClientResult<Response> {
        match self.request(&request)? {
            Response::Error(message) => Err(ClientError::Server(message)),
            response => Ok(response),
        }
    }

    fn call_ok(&mut self, request: Request) -> ClientResult<()> {
        expect_response!(self.call(request)?, Response::Ok => ())
    }

    pub fn list(&mut self) -> ClientResult<BTreeMap<String, CollectionKind>> {
        expect_response!(self.call(Request::List)?, Response::Collections(c) => c)
    }

    pub fn item_create(&mut self, name: &str) -> ClientResult<()> {
        self.call_ok(Request::ItemCreate { name: name.into() })
    }

    pub fn item_get(&mut self, name: &str) -> ClientResult<Vec<u8>> {
        expect_response!(self.call(Request::ItemGet { name: name.into() })?, Response::Bytes(b) => b)
    }

    pub fn item_set(&mut self, name: &str, value: &[u8]) -> ClientResult<()> {
        self.call_ok(Request::ItemSet {
            name: name.into(),
            value: value.to_vec(),
        })
    }

    pub fn hash_create(&mut self, name: &str) -> ClientResult<()> {
        self.call_ok(Request::HashCreate { name: name.into() })
    }

    pub fn hash_get(&mut self, name: &str, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        let request = Request::HashGet {
            name: name.into(),
            key: key.to_vec(),
        };
        expect_response!(self.call(request)?, Response::OptionalBytes(b) => b)
    }

    pub fn hash_set(&mut self, name: &str, key: &[u8], value: &[u8]) -> ClientResult<()> {
        self.call_ok(Request::HashSet {
            name: name.into(),
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    pub fn hash_delete(&mut self, name: &str, key: &[u8]) -> ClientResult<()> {
        self.call_ok(Request::HashDelete {
            name: name.into(),
            key: key.to_vec(),
        })
    }

    pub fn hash_iter(&mut self, name: &str) -> ClientResult<IterHandle> {
        expect_response!(self.call(Request::HashIter { name: name.into() })?, Response::Iter(i) => i)
    }

    pub fn hash_iter_next(&mut self, iter: IterHandle) -> ClientResult<Option<(Vec<u8>, Vec<u8>)>> {
        expect_response!(self.call(Request::HashIterNext { iter })?, Response::Pair(p) => p)
    }

    pub fn list_create(&mut self, name: &str) -> ClientResult<()> {
        self.call_ok(Request::ListCreate { name: name.into() })
    }

    pub fn list_get(&mut self, name: &str, index: i64) -> ClientResult<Vec<u8>> {
        let request = Request::ListGet {
            name: name.into(),
            index,
        };
        expect_response!(self.call(request)?, Response::Bytes(b) => b)
    }

    /// Insert before `index`, or append when `index` is `None`
    pub fn list_insert(&mut self, name: &str, index: Option<i64>, value: &[u8]) -> ClientResult<()> {
        self.call_ok(Request::ListInsert {
            name: name.into(),
            index,
            value: value.to_vec(),
        })
    }

    /// Remove and return the value at `index`, or the last one
    pub fn list_delete(&mut self, name: &str, index: Option<i64>) -> ClientResult<Vec<u8>> {
        let request = Request::ListDelete {
            name: name.into(),
            index,
        };
        expect_response!(self.call(request)?, Response::Bytes(b) => b)
    }

    pub fn list_size(&mut self, name: &str) -> ClientResult<u64> {
        expect_response!(self.call(Request::ListSize { name: name.into() })?, Response::Size(s) => s)
    }

    pub fn sorted_create(&mut self, name: &str) -> ClientResult<()> {
        self.call_ok(Request::SortedCreate { name: name.into() })
    }

    pub fn sorted_get(&mut self, name: &str, prefix: &[KeyElement]) -> ClientResult<Vec<(Key, Vec<u8>)>> {
        let request = Request::SortedGet {
            name: name.into(),
            key: prefix.to_vec(),
        };
        expect_response!(self.call(request)?, Response::Pairs(p) => p)
    }

    pub fn sorted_insert(&mut self, name: &str, key: &[KeyElement], value: &[u8]) -> ClientResult<()> {
        self.call_ok(Request::SortedInsert {
            name: name.into(),
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    pub fn sorted_delete(&mut self, name: &str, key: &[KeyElement]) -> ClientResult<()> {
        self.call_ok(Request::SortedDelete {
            name: name.into(),
            key: key.to_vec(),
        })
    }
}
