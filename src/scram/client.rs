//! Client half of the SCRAM exchange.

use subtle::ConstantTimeEq;
use tracing::{debug, trace};
use zeroize::Zeroizing;

use super::messages::{
    add_attribute, add_attribute_b64, decode_attribute_list, decode_base64, parse_iteration_count,
};
use crate::crypto::{self, Algorithm};
use crate::error::{Error, Result};
use crate::sasl::{ClientMechanism, Mechanism, Step};
use crate::session::ClientCallbacks;

enum State {
    /// `start` has not run yet.
    Initial,
    /// The client-first-message went out; waiting for the
    /// server-first-message.
    ExpectServerFirst,
    /// The client-final-message went out; waiting for the
    /// server-final-message.
    ExpectServerFinal,
    Done,
}

pub(crate) struct ScramClient {
    algorithm: Algorithm,
    state: State,

    client_nonce: String,
    /// Combined nonce as handed back by the server.
    nonce: String,

    salted_password: Zeroizing<Vec<u8>>,

    client_first_message_bare: String,
    server_first_message: String,
    client_final_message_without_proof: String,
}

impl ScramClient {
    pub(crate) fn new(mechanism: Mechanism, nonce_override: Option<String>) -> Result<Self> {
        let algorithm = mechanism
            .algorithm()
            .ok_or(Error::BadParameter("not a scram mechanism"))?;
        Ok(ScramClient {
            algorithm,
            state: State::Initial,
            client_nonce: super::generate_nonce(nonce_override)?,
            nonce: String::new(),
            salted_password: Zeroizing::new(Vec::new()),
            client_first_message_bare: String::new(),
            server_first_message: String::new(),
            client_final_message_without_proof: String::new(),
        })
    }

    fn handle_server_first(&mut self, callbacks: &ClientCallbacks, input: &str) -> Result<Step> {
        self.server_first_message = input.to_owned();

        let attributes = decode_attribute_list(input)?;
        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for (key, value) in &attributes {
            match *key {
                'r' => nonce = Some(value.clone()),
                's' => salt = Some(decode_base64(value)?),
                'i' => iterations = Some(parse_iteration_count(value)?),
                _ => return Err(Error::BadParameter("unsupported attribute supplied")),
            }
        }
        let (Some(nonce), Some(salt), Some(iterations)) = (nonce, salt, iterations) else {
            debug!("missing r/s/i in server-first-message");
            return Err(Error::BadParameter("missing mandatory attribute"));
        };

        // RFC 5802 §5.1: the combined nonce must open with the nonce we
        // sent, otherwise someone is answering for a different exchange.
        if !nonce.starts_with(&self.client_nonce) {
            return Err(Error::BadParameter(
                "combined nonce does not start with the client nonce",
            ));
        }
        self.nonce = nonce;

        let password = (callbacks.get_password)();
        self.salted_password = Zeroizing::new(crypto::pbkdf2_hmac(
            self.algorithm,
            password.as_bytes(),
            &salt,
            iterations,
        )?);

        let mut out = String::new();
        add_attribute_b64(&mut out, 'c', b"n,,", true);
        add_attribute(&mut out, 'r', &self.nonce, false)?;
        self.client_final_message_without_proof = out.clone();

        let auth_message = super::auth_message(
            &self.client_first_message_bare,
            &self.server_first_message,
            &self.client_final_message_without_proof,
        );
        let proof = super::client_proof(self.algorithm, &self.salted_password, &auth_message);
        out.push(',');
        add_attribute_b64(&mut out, 'p', &proof, false);

        trace!(message = %out, "client-final-message");
        self.state = State::ExpectServerFinal;
        Ok(Step::Continue(out.into_bytes()))
    }

    fn handle_server_final(&mut self, input: &str) -> Result<Step> {
        let attributes = decode_attribute_list(input)?;
        self.state = State::Done;

        if let Some(error) = attributes.get(&'e') {
            debug!(%error, "authentication failed by server");
            return Err(Error::Fail("server reported an error"));
        }
        let Some(verifier) = attributes.get(&'v') else {
            debug!("server-final-message is missing 'v'");
            return Err(Error::BadParameter("missing server signature"));
        };

        let auth_message = super::auth_message(
            &self.client_first_message_bare,
            &self.server_first_message,
            &self.client_final_message_without_proof,
        );
        let expected =
            super::server_signature(self.algorithm, &self.salted_password, &auth_message);
        let verifier = decode_base64(verifier)?;

        if !bool::from(verifier.ct_eq(&expected)) {
            debug!("incorrect server signature received");
            return Err(Error::Fail("incorrect server signature"));
        }

        Ok(Step::Success(Vec::new()))
    }
}

impl ClientMechanism for ScramClient {
    fn start(&mut self, callbacks: &ClientCallbacks) -> Result<Step> {
        if !matches!(self.state, State::Initial) {
            return Err(Error::BadParameter("start called out of sequence"));
        }

        let username = (callbacks.get_username)();

        let mut out = String::from("n,,");
        add_attribute(&mut out, 'n', &username, true)?;
        add_attribute(&mut out, 'r', &self.client_nonce, false)?;

        self.client_first_message_bare = out["n,,".len()..].to_owned();

        trace!(message = %out, "client-first-message");
        self.state = State::ExpectServerFirst;
        Ok(Step::Success(out.into_bytes()))
    }

    fn step(&mut self, callbacks: &ClientCallbacks, input: &[u8]) -> Result<Step> {
        if input.is_empty() {
            return Err(Error::BadParameter("empty server message"));
        }
        let input = std::str::from_utf8(input)
            .map_err(|_| Error::BadParameter("server message is not valid UTF-8"))?;

        match self.state {
            State::ExpectServerFirst => self.handle_server_first(callbacks, input),
            State::ExpectServerFinal => self.handle_server_final(input),
            _ => Err(Error::BadParameter("step called out of sequence")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ClientCallbacks;

    fn callbacks() -> ClientCallbacks {
        ClientCallbacks {
            get_username: Box::new(|| "user".to_owned()),
            get_password: Box::new(|| "pencil".to_owned()),
        }
    }

    fn started_client() -> ScramClient {
        let mut client = ScramClient::new(
            Mechanism::ScramSha1,
            Some("fyko+d2lbbFgONRv9qkxdawL".to_owned()),
        )
        .unwrap();
        let Step::Success(first) = client.start(&callbacks()).unwrap() else {
            panic!("expected client-first-message");
        };
        assert_eq!(first, b"n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL");
        client
    }

    #[test]
    fn rfc5802_example_exchange() {
        let mut client = started_client();

        let server_first =
            b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096";
        let Step::Continue(client_final) = client.step(&callbacks(), server_first).unwrap() else {
            panic!("expected client-final-message");
        };
        assert_eq!(
            client_final,
            b"c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,\
              p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts="
                .to_vec()
        );

        let server_final = b"v=rmF9pqV8S7suAoZWja4dJRkFsKQ=";
        assert!(matches!(
            client.step(&callbacks(), server_final).unwrap(),
            Step::Success(_)
        ));
    }

    #[test]
    fn rejects_nonce_not_extending_ours() {
        let mut client = started_client();
        let server_first = b"r=someoneelsesnonce,s=QSXCR+Q6sek8bf92,i=4096";
        assert!(matches!(
            client.step(&callbacks(), server_first),
            Err(Error::BadParameter(_))
        ));
    }

    #[test]
    fn fails_on_server_error_attribute() {
        let mut client = started_client();
        let server_first =
            b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096";
        client.step(&callbacks(), server_first).unwrap();
        assert!(matches!(
            client.step(&callbacks(), b"e=other-error"),
            Err(Error::Fail(_))
        ));
    }

    #[test]
    fn fails_on_wrong_server_signature() {
        let mut client = started_client();
        let server_first =
            b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096";
        client.step(&callbacks(), server_first).unwrap();
        assert!(matches!(
            client.step(&callbacks(), b"v=cm1GOXBxVjhTN3N1QW9aV2phNGRKUg=="),
            Err(Error::Fail(_))
        ));
    }

    #[test]
    fn rejects_unknown_attribute_in_server_first() {
        let mut client = started_client();
        let server_first = b"r=fyko+d2lbbFgONRv9qkxdawLxyz,s=QSXCR+Q6sek8bf92,i=4096,m=ext";
        assert!(client.step(&callbacks(), server_first).is_err());
    }
}
