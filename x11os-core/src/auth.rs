//! Authorization schemes and authority files.
//!
//! Schemes register by protocol name in an [`Authorization`] registry. The
//! handshake hands it the protocol name and data a client sent and gets
//! back either the id of the matching credentials or a refusal reason.

use crate::client::{AuthId, ClientId};
use crate::error::{Error, Result};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

pub const MIT_MAGIC_COOKIE: &str = "MIT-MAGIC-COOKIE-1";

pub const FAMILY_INTERNET: u16 = 0;
pub const FAMILY_LOCAL: u16 = 256;
pub const FAMILY_WILD: u16 = 65535;

pub trait AuthScheme {
    fn name(&self) -> &str;
    /// Store credentials under `id`, replacing identical ones.
    fn add(&mut self, id: AuthId, data: &[u8]);
    /// Id of the stored credentials matching `data`, or why none match.
    fn check(&self, data: &[u8], client: ClientId) -> std::result::Result<AuthId, &'static str>;
    fn remove(&mut self, id: AuthId) -> bool;
    fn reset(&mut self);
    fn is_empty(&self) -> bool;
}

/// Shared-secret cookies compared byte for byte.
#[derive(Debug, Default)]
pub struct MitMagicCookie {
    cookies: Vec<(AuthId, Vec<u8>)>,
}

impl AuthScheme for MitMagicCookie {
    fn name(&self) -> &str {
        MIT_MAGIC_COOKIE
    }

    fn add(&mut self, id: AuthId, data: &[u8]) {
        self.cookies.retain(|(_, c)| c != data);
        self.cookies.push((id, data.to_vec()));
    }

    fn check(&self, data: &[u8], _client: ClientId) -> std::result::Result<AuthId, &'static str> {
        self.cookies
            .iter()
            .find(|(_, cookie)| constant_time_eq(cookie, data))
            .map(|(id, _)| *id)
            .ok_or("Invalid MIT-MAGIC-COOKIE-1 key")
    }

    fn remove(&mut self, id: AuthId) -> bool {
        let before = self.cookies.len();
        self.cookies.retain(|(i, _)| *i != id);
        self.cookies.len() != before
    }

    fn reset(&mut self) {
        self.cookies.clear();
    }

    fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Registry of schemes, looked up by protocol name.
pub struct Authorization {
    schemes: Vec<Box<dyn AuthScheme>>,
    next_id: u32,
}

impl Default for Authorization {
    fn default() -> Self {
        let mut auth = Self::empty();
        auth.register(Box::new(MitMagicCookie::default()));
        auth
    }
}

impl Authorization {
    /// A registry with no schemes at all.
    pub fn empty() -> Self {
        Self {
            schemes: Vec::new(),
            next_id: 1,
        }
    }

    /// Add a scheme, replacing one registered under the same name.
    pub fn register(&mut self, scheme: Box<dyn AuthScheme>) {
        self.schemes.retain(|s| s.name() != scheme.name());
        self.schemes.push(scheme);
    }

    /// Store credentials for scheme `name`. Unknown schemes are ignored.
    pub fn add(&mut self, name: &str, data: &[u8]) -> Option<AuthId> {
        let scheme = self.schemes.iter_mut().find(|s| s.name() == name)?;
        let id = AuthId(self.next_id);
        self.next_id += 1;
        scheme.add(id, data);
        Some(id)
    }

    pub fn remove(&mut self, id: AuthId) -> bool {
        self.schemes.iter_mut().any(|s| s.remove(id))
    }

    /// Forget every stored credential. Done on server reset before the
    /// authority file is read again.
    pub fn reset(&mut self) {
        for scheme in &mut self.schemes {
            scheme.reset();
        }
    }

    /// No credentials stored in any scheme.
    pub fn is_empty(&self) -> bool {
        self.schemes.iter().all(|s| s.is_empty())
    }

    /// Check the protocol name and data from a setup prefix.
    pub fn check(&self, name: &[u8], data: &[u8], client: ClientId) -> std::result::Result<AuthId, &'static str> {
        if name.is_empty() {
            return Err("No protocol specified\n");
        }
        let Some(scheme) = self.schemes.iter().find(|s| s.name().as_bytes() == name) else {
            return Err("Protocol not supported by server\n");
        };
        scheme.check(data, client)
    }

    /// Add every entry of an authority file. Returns how many were usable.
    pub fn load_file(&mut self, path: &Path) -> Result<usize> {
        let entries = AuthorityEntry::read_file(path)?;
        let mut added = 0;
        for entry in &entries {
            let Ok(name) = std::str::from_utf8(&entry.name) else {
                continue;
            };
            if self.add(name, &entry.data).is_some() {
                added += 1;
            }
        }
        log::debug!("loaded {} of {} authority entries from {}", added, entries.len(), path.display());
        Ok(added)
    }
}

/// One record of an authority file: big-endian family, then four
/// length-prefixed strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityEntry {
    pub family: u16,
    pub address: Vec<u8>,
    pub number: Vec<u8>,
    pub name: Vec<u8>,
    pub data: Vec<u8>,
}

fn read_u16(r: &mut impl Read) -> io::Result<Option<u16>> {
    let mut b = [0u8; 2];
    match r.read_exact(&mut b) {
        Ok(()) => Ok(Some(u16::from_be_bytes(b))),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

fn read_counted(r: &mut impl Read) -> Result<Vec<u8>> {
    let len = read_u16(r)?.ok_or_else(|| Error::Authority("truncated entry".into()))?;
    let mut data = vec![0u8; len as usize];
    r.read_exact(&mut data)
        .map_err(|_| Error::Authority("truncated entry".into()))?;
    Ok(data)
}

fn write_counted(w: &mut impl Write, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len()).map_err(|_| Error::Authority("field too long".into()))?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(data)?;
    Ok(())
}

impl AuthorityEntry {
    /// A cookie for display `number` on the local machine.
    pub fn local(hostname: &str, number: u32, cookie: &[u8]) -> Self {
        Self {
            family: FAMILY_LOCAL,
            address: hostname.as_bytes().to_vec(),
            number: number.to_string().into_bytes(),
            name: MIT_MAGIC_COOKIE.as_bytes().to_vec(),
            data: cookie.to_vec(),
        }
    }

    pub fn read_from(r: &mut impl Read) -> Result<Option<Self>> {
        let Some(family) = read_u16(r)? else {
            return Ok(None);
        };
        Ok(Some(Self {
            family,
            address: read_counted(r)?,
            number: read_counted(r)?,
            name: read_counted(r)?,
            data: read_counted(r)?,
        }))
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<()> {
        w.write_all(&self.family.to_be_bytes())?;
        write_counted(w, &self.address)?;
        write_counted(w, &self.number)?;
        write_counted(w, &self.name)?;
        write_counted(w, &self.data)?;
        Ok(())
    }

    pub fn read_file(path: &Path) -> Result<Vec<Self>> {
        let mut r = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        while let Some(entry) = Self::read_from(&mut r)? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Add `self` to the file at `path`, dropping any entry for the same
    /// family, address, display and scheme.
    pub fn merge_into_file(&self, path: &Path) -> Result<()> {
        let mut entries = match Self::read_file(path) {
            Ok(entries) => entries,
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        entries.retain(|e| {
            !(e.family == self.family
                && e.address == self.address
                && e.number == self.number
                && e.name == self.name)
        });
        entries.push(self.clone());

        let mut w = BufWriter::new(File::create(path)?);
        for entry in &entries {
            entry.write_to(&mut w)?;
        }
        w.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT: ClientId = ClientId::new(1);

    #[test]
    fn test_cookie_check() {
        let mut auth = Authorization::default();
        assert!(auth.is_empty());
        let id = auth.add(MIT_MAGIC_COOKIE, &[1; 16]).unwrap();
        assert_eq!(auth.check(MIT_MAGIC_COOKIE.as_bytes(), &[1; 16], CLIENT), Ok(id));
        assert!(auth.check(MIT_MAGIC_COOKIE.as_bytes(), &[2; 16], CLIENT).is_err());
        assert_eq!(auth.check(b"", &[], CLIENT), Err("No protocol specified\n"));
        assert_eq!(
            auth.check(b"XDM-AUTHORIZATION-1", &[1; 16], CLIENT),
            Err("Protocol not supported by server\n")
        );
    }

    #[test]
    fn test_remove_and_reset() {
        let mut auth = Authorization::default();
        let a = auth.add(MIT_MAGIC_COOKIE, b"aaaa").unwrap();
        auth.add(MIT_MAGIC_COOKIE, b"bbbb").unwrap();
        assert!(auth.remove(a));
        assert!(auth.check(MIT_MAGIC_COOKIE.as_bytes(), b"aaaa", CLIENT).is_err());
        auth.reset();
        assert!(auth.is_empty());
        assert!(auth.add("SUN-DES-1", b"x").is_none());
    }

    #[test]
    fn test_authority_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Xauthority");
        let first = AuthorityEntry::local("box", 1, &[7; 16]);
        let second = AuthorityEntry::local("box", 2, &[8; 16]);
        first.merge_into_file(&path).unwrap();
        second.merge_into_file(&path).unwrap();
        // replacing the display 1 cookie keeps a single entry for it
        let replaced = AuthorityEntry::local("box", 1, &[9; 16]);
        replaced.merge_into_file(&path).unwrap();

        let entries = AuthorityEntry::read_file(&path).unwrap();
        assert_eq!(entries, vec![second, replaced]);

        let mut auth = Authorization::default();
        assert_eq!(auth.load_file(&path).unwrap(), 2);
        assert!(auth.check(MIT_MAGIC_COOKIE.as_bytes(), &[9; 16], CLIENT).is_ok());
    }

    #[test]
    fn test_truncated_authority_file() {
        let mut data = Vec::new();
        AuthorityEntry::local("box", 0, &[1; 16]).write_to(&mut data).unwrap();
        data.truncate(data.len() - 3);
        assert!(matches!(
            AuthorityEntry::read_from(&mut data.as_slice()),
            Err(Error::Authority(_))
        ));
    }
}
