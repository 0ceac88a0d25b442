//! Server half of the SCRAM exchange.

use std::sync::Arc;

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use tracing::{debug, trace};

use super::messages::{
    add_attribute, add_attribute_b64, add_iteration_count, decode_attribute_list, decode_username,
    saslprep,
};
use crate::crypto;
use crate::error::{Error, Result};
use crate::pwdb::{PasswordStore, User, UserFactory};
use crate::sasl::{Domain, Mechanism, ServerMechanism, ServerMechanismConfig, Step};
use crate::saslauthd;

enum State {
    /// Waiting for the client-first-message.
    ExpectClientFirst,
    /// Waiting for the client-final-message.
    ExpectClientFinal,
    Done,
}

pub(crate) struct ScramServer {
    mechanism: Mechanism,
    store: Arc<PasswordStore>,
    state: State,

    username: String,
    user: Option<User>,

    server_nonce: String,
    /// Combined client + server nonce.
    nonce: String,

    client_first_message_bare: String,
    server_first_message: String,
}

impl ScramServer {
    pub(crate) fn new(mechanism: Mechanism, config: ServerMechanismConfig) -> Result<Self> {
        debug_assert!(mechanism.algorithm().is_some());
        Ok(ScramServer {
            mechanism,
            store: config.store,
            state: State::ExpectClientFirst,
            username: String::new(),
            user: None,
            server_nonce: super::generate_nonce(config.nonce_override)?,
            nonce: String::new(),
            client_first_message_bare: String::new(),
            server_first_message: String::new(),
        })
    }

    fn handle_client_first(&mut self, input: &[u8]) -> Result<Step> {
        let client_first_message = std::str::from_utf8(input)
            .map_err(|_| Error::BadParameter("client-first-message is not valid UTF-8"))?;
        trace!(mechanism = %self.mechanism, "server start");

        // The gs2-header is "n,[authzid],". We advertise no -PLUS
        // variants, so a client asking for channel binding ("p=") or
        // hedging ("y") is turned away.
        if !client_first_message.starts_with("n,") {
            debug!("client requested channel binding");
            return Err(Error::BadParameter("channel binding is not supported"));
        }

        let bare_offset = client_first_message[2..]
            .find(',')
            .ok_or(Error::BadParameter("malformed gs2-header"))?
            + 3;
        self.client_first_message_bare = client_first_message[bare_offset..].to_owned();

        let attributes = decode_attribute_list(&self.client_first_message_bare)?;
        let mut username = None;
        let mut client_nonce = None;
        for (key, value) in &attributes {
            match *key {
                'n' => username = Some(value.clone()),
                'r' => client_nonce = Some(value.clone()),
                _ => return Err(Error::BadParameter("unsupported attribute supplied")),
            }
        }
        let (Some(username), Some(client_nonce)) = (username, client_nonce) else {
            return Err(Error::BadParameter("missing mandatory attribute"));
        };
        if username.is_empty() || client_nonce.is_empty() {
            return Err(Error::BadParameter("missing mandatory attribute"));
        }

        self.username = saslprep(&decode_username(&username)?)?;

        self.user = Some(match self.store.lookup(&self.username) {
            Some(user) => user,
            None => {
                debug!(username = %self.username, "user doesn't exist, using dummy");
                UserFactory::create_dummy(&self.username, self.mechanism)?
            }
        });
        let user = self.user.as_ref().expect("just set");
        let metadata = user.password_for(self.mechanism)?;

        self.nonce = format!("{client_nonce}{}", self.server_nonce);

        let mut out = String::new();
        add_attribute(&mut out, 'r', &self.nonce, true)?;
        add_attribute_b64(&mut out, 's', &metadata.decoded_salt()?, true);
        add_iteration_count(&mut out, metadata.iteration_count(), false);
        self.server_first_message = out;

        trace!(message = %self.server_first_message, "server-first-message");
        self.state = State::ExpectClientFinal;
        Ok(Step::Continue(self.server_first_message.clone().into_bytes()))
    }

    fn handle_client_final(&mut self, input: &[u8]) -> Result<Step> {
        let client_final_message = std::str::from_utf8(input)
            .map_err(|_| Error::BadParameter("client-final-message is not valid UTF-8"))?;

        let attributes = decode_attribute_list(client_final_message)?;
        let Some(client_proof) = attributes.get(&'p') else {
            debug!("client-final-message does not contain client proof");
            return Err(Error::BadParameter("missing client proof"));
        };

        let without_proof = match client_final_message.find(",p=") {
            Some(index) => &client_final_message[..index],
            None => client_final_message,
        };

        let user = self.user.as_ref().expect("set while handling client-first");
        let metadata = user.password_for(self.mechanism)?;
        let algorithm = self
            .mechanism
            .algorithm()
            .expect("scram mechanisms carry an algorithm");
        let auth_message = super::auth_message(
            &self.client_first_message_bare,
            &self.server_first_message,
            without_proof,
        );

        // The server-final-message is assembled before the proof is
        // examined so the work done is the same on every path.
        let mut server_final_message = String::new();
        if user.is_dummy() && saslauthd::is_configured() {
            add_attribute(
                &mut server_final_message,
                'e',
                "scram-not-supported-for-ldap-users",
                false,
            )?;
        } else {
            let signature = super::server_signature(algorithm, metadata.password(), &auth_message);
            add_attribute_b64(&mut server_final_message, 'v', &signature, false);
        }

        let expected = BASE64_STANDARD
            .encode(super::client_proof(algorithm, metadata.password(), &auth_message));

        // A dummy user flips the outcome so that a "successful" proof
        // against a fabricated secret is reported exactly like a
        // mismatch against a real one. The trailing is_dummy guard
        // keeps a dummy from ever reading as authenticated, whatever
        // value the comparison accumulator took.
        let compare = crypto::secure_compare(client_proof.as_bytes(), expected.as_bytes());
        let fail = compare ^ u32::from(user.is_dummy());

        self.state = State::Done;
        if fail != 0 || user.is_dummy() {
            if user.is_dummy() {
                return Err(Error::NoUser);
            }
            return Err(Error::PasswordError);
        }

        trace!(message = %server_final_message, "server-final-message");
        Ok(Step::Success(server_final_message.into_bytes()))
    }
}

impl ServerMechanism for ScramServer {
    fn start(&mut self, input: &[u8]) -> Result<Step> {
        if input.is_empty() {
            return Err(Error::BadParameter("empty client-first-message"));
        }
        match self.state {
            State::ExpectClientFirst => self.handle_client_first(input),
            _ => Err(Error::BadParameter("start called out of sequence")),
        }
    }

    fn step(&mut self, input: &[u8]) -> Result<Step> {
        if input.is_empty() {
            return Err(Error::BadParameter("empty client-final-message"));
        }
        match self.state {
            State::ExpectClientFinal => self.handle_client_final(input),
            _ => Err(Error::BadParameter("step called out of sequence")),
        }
    }

    fn username(&self) -> &str {
        &self.username
    }

    fn domain(&self) -> Domain {
        Domain::Local
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::pwdb::PasswordDatabase;

    fn store_with(username: &str, password: &str) -> Arc<PasswordStore> {
        let store = Arc::new(PasswordStore::new());
        let mut db = PasswordDatabase::default();
        db.insert(UserFactory::create(username, password).unwrap());
        store.install(db);
        store
    }

    fn server(store: &Arc<PasswordStore>, nonce: &str) -> ScramServer {
        ScramServer::new(
            Mechanism::ScramSha1,
            ServerMechanismConfig {
                store: Arc::clone(store),
                nonce_override: Some(nonce.to_owned()),
            },
        )
        .unwrap()
    }

    #[test]
    fn rejects_channel_binding_requests() {
        let store = store_with("user", "pencil");
        for message in ["y,,n=user,r=abc", "p=tls-unique,,n=user,r=abc"] {
            let mut scram = server(&store, "nonce");
            assert!(matches!(
                scram.start(message.as_bytes()),
                Err(Error::BadParameter(_))
            ));
        }
    }

    #[test]
    fn rejects_extra_attributes_in_client_first() {
        let store = store_with("user", "pencil");
        let mut scram = server(&store, "nonce");
        assert!(matches!(
            scram.start(b"n,,n=user,r=abc,x=extension"),
            Err(Error::BadParameter(_))
        ));
    }

    #[test]
    fn rejects_missing_mandatory_attributes() {
        let store = store_with("user", "pencil");
        for message in [&b"n,,n=user"[..], b"n,,r=abc", b"n,,n=,r=abc"] {
            let mut scram = server(&store, "nonce");
            assert!(scram.start(message).is_err());
        }
    }

    #[test]
    fn unknown_user_gets_well_formed_server_first() {
        let store = store_with("user", "pencil");
        let mut scram = server(&store, "srvnonce");
        let Step::Continue(reply) = scram.start(b"n,,n=ghost,r=clientnonce").unwrap() else {
            panic!("expected continue");
        };
        let reply = String::from_utf8(reply).unwrap();
        let attributes = decode_attribute_list(&reply).unwrap();
        assert_eq!(attributes[&'r'], "clientnoncesrvnonce");
        assert!(attributes[&'i'].parse::<u32>().unwrap() >= 1);
        assert!(!attributes[&'s'].is_empty());

        // Identical attribute shape to a real user's server-first.
        let mut scram = server(&store, "srvnonce");
        let Step::Continue(real) = scram.start(b"n,,n=user,r=clientnonce").unwrap() else {
            panic!("expected continue");
        };
        let real = decode_attribute_list(std::str::from_utf8(&real).unwrap()).unwrap();
        assert_eq!(
            real.keys().collect::<Vec<_>>(),
            attributes.keys().collect::<Vec<_>>()
        );
    }
}
