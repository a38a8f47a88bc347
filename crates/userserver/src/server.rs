//! Command dispatch for the user service's RESP-style protocol.

use std::sync::Arc;

use forge_protocol::resp::{read_command, write_value, RespValue};
use forge_protocol::ServiceError;
use tokio::io::BufReader;
use tokio::net::TcpListener;

use crate::token::TokenType;
use crate::userdata::{validate_key, validate_value};
use crate::usermanagement::UserManagement;

pub struct ServerState {
    pub user_management: UserManagement,
    pub token_store: crate::token::TokenStore,
    pub max_user_data_key_size: usize,
    pub max_user_data_value_size: usize,
}

pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            tracing::debug!(%peer, "connection accepted");
            if let Err(err) = handle_connection(stream, state).await {
                tracing::warn!(%peer, error = %err, "connection ended with error");
            }
        });
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, state: Arc<ServerState>) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    while let Some(args) = read_command(&mut reader).await? {
        let reply = dispatch(&args, &state);
        write_value(&mut write_half, &reply).await?;
    }
    Ok(())
}

fn dispatch(args: &[String], state: &ServerState) -> RespValue {
    let Some(verb) = args.first() else {
        return RespValue::error(ServiceError::bad_request());
    };
    match run_command(verb, &args[1..], state) {
        Ok(value) => value,
        Err(err) => RespValue::error(err),
    }
}

/// Splits an even-length tail of `key value key value ...` arguments into
/// pairs, rejecting an odd count up front (`ADDUSER`/`SET`'s trailing
/// config list).
fn pair_up<'a>(args: &'a [String]) -> Result<Vec<(&'a str, &'a str)>, ServiceError> {
    if args.len() % 2 != 0 {
        return Err(ServiceError::bad_request());
    }
    Ok(args.chunks(2).map(|pair| (pair[0].as_str(), pair[1].as_str())).collect())
}

fn run_command(verb: &str, args: &[String], state: &ServerState) -> Result<RespValue, ServiceError> {
    match verb.to_ascii_uppercase().as_str() {
        "PING" => Ok(RespValue::Simple("PONG".to_string())),

        "HELP" => Ok(RespValue::bulk(help_text(args.first().map(String::as_str)))),

        "ADDUSER" => {
            if args.len() < 2 {
                return Err(ServiceError::bad_request());
            }
            let name = args[0].as_str();
            let password = args[1].as_str();
            let config = pair_up(&args[2..])?;
            let user_id = state.user_management.add(name, password, &config)?;
            Ok(RespValue::bulk(user_id))
        }

        "DELUSER" => {
            let [user_id] = require_args(args)?;
            state.user_management.remove(user_id)?;
            state.token_store.clear_tokens(user_id).map_err(|_| ServiceError::internal_error())?;
            Ok(RespValue::ok())
        }

        "LOGIN" => {
            let [name, password] = require_args(args)?;
            let user_id = state.user_management.login(name, password)?;
            let token = state
                .token_store
                .get_token(&user_id, TokenType::Login)
                .map_err(|_| ServiceError::internal_error())?;
            Ok(RespValue::Array(vec![RespValue::bulk(user_id), RespValue::bulk(token)]))
        }

        "LOOKUP" => {
            let [name] = require_args(args)?;
            Ok(RespValue::bulk(state.user_management.get_user_id_by_name(name)?))
        }

        "NAME" => {
            let [user_id] = require_args(args)?;
            Ok(RespValue::bulk(state.user_management.get_name_by_user_id(user_id)?))
        }

        "MNAME" => {
            let user_ids: Vec<&str> = args.iter().map(String::as_str).collect();
            let names = state.user_management.get_names_by_user_ids(&user_ids)?;
            Ok(RespValue::Array(names.into_iter().map(RespValue::bulk).collect()))
        }

        "GET" => {
            let [user_id, key] = require_args(args)?;
            match state.user_management.get_profile(user_id, key)? {
                Some(value) => Ok(RespValue::bulk(value)),
                None => Ok(RespValue::nil()),
            }
        }

        "MGET" => {
            if args.len() < 2 {
                return Err(ServiceError::bad_request());
            }
            let user_id = args[0].as_str();
            let keys: Vec<&str> = args[1..].iter().map(String::as_str).collect();
            let values = state.user_management.get_profiles(user_id, &keys)?;
            Ok(RespValue::Array(
                values.into_iter().map(|v| v.map(RespValue::bulk).unwrap_or_else(RespValue::nil)).collect(),
            ))
        }

        "SET" => {
            if args.is_empty() {
                return Err(ServiceError::bad_request());
            }
            let user_id = args[0].as_str();
            let config = pair_up(&args[1..])?;
            state.user_management.set_profiles(user_id, &config)?;
            Ok(RespValue::ok())
        }

        "PASSWD" => {
            let [user_id, password] = require_args(args)?;
            state.user_management.set_password(user_id, password)?;
            state
                .token_store
                .clear_tokens(user_id)
                .map_err(|_| ServiceError::internal_error())?;
            Ok(RespValue::ok())
        }

        "MAKETOKEN" => {
            let [user_id, token_type] = require_args(args)?;
            let token_type = TokenType::parse(token_type).ok_or_else(ServiceError::bad_request)?;
            let token = state
                .token_store
                .get_token(user_id, token_type)
                .map_err(|_| ServiceError::internal_error())?;
            Ok(RespValue::bulk(token))
        }

        "CHECKTOKEN" => {
            if args.is_empty() {
                return Err(ServiceError::bad_request());
            }
            let token = args[0].as_str();
            let mut token_type = None;
            let mut renew = false;
            let mut rest = &args[1..];
            while let Some((opt, tail)) = rest.split_first() {
                match opt.to_ascii_uppercase().as_str() {
                    "TYPE" => {
                        let Some((value, tail2)) = tail.split_first() else {
                            return Err(ServiceError::bad_request());
                        };
                        token_type = Some(TokenType::parse(value).ok_or_else(ServiceError::bad_request)?);
                        rest = tail2;
                    }
                    "RENEW" => {
                        renew = true;
                        rest = tail;
                    }
                    _ => return Err(ServiceError::bad_request()),
                }
            }
            let (user_id, new_token) = state.token_store.check_token(token, token_type, renew)?;
            match new_token {
                Some(new_token) => Ok(RespValue::Array(vec![RespValue::bulk(user_id), RespValue::bulk(new_token)])),
                None => Ok(RespValue::bulk(user_id)),
            }
        }

        "RESETTOKEN" => {
            if args.is_empty() {
                return Err(ServiceError::bad_request());
            }
            let user_id = args[0].as_str();
            if args.len() == 1 {
                state.token_store.clear_tokens(user_id).map_err(|_| ServiceError::internal_error())?;
            } else {
                let types: Vec<TokenType> =
                    args[1..].iter().map(|t| TokenType::parse(t).ok_or_else(ServiceError::bad_request)).collect::<Result<_, _>>()?;
                state
                    .token_store
                    .clear_token_types(user_id, &types)
                    .map_err(|_| ServiceError::internal_error())?;
            }
            Ok(RespValue::ok())
        }

        "UGET" => {
            let [user_id, key] = require_args(args)?;
            let value = state.user_management.with_user_data(user_id, |data| data.get(key).map(str::to_string));
            Ok(value.map(RespValue::bulk).unwrap_or_else(RespValue::nil))
        }

        "USET" => {
            let [user_id, key, value] = require_args(args)?;
            validate_key(key, state.max_user_data_key_size)?;
            validate_value(value, state.max_user_data_value_size)?;
            state.user_management.with_user_data(user_id, |data| data.set(key, value));
            Ok(RespValue::ok())
        }

        _ => Err(ServiceError::bad_request()),
    }
}

fn help_text(topic: Option<&str>) -> &'static str {
    match topic.map(str::to_ascii_uppercase).as_deref() {
        Some("TOKEN") => "Token commands:\nMAKETOKEN uid type\nCHECKTOKEN token [TYPE type] [RENEW]\nRESETTOKEN uid [type...]\n",
        Some("USER") => {
            "User command:\nADDUSER user pass [k v...]\nLOGIN user pass\nLOOKUP user\nNAME uid\nMNAME uid...\nGET uid k\nMGET uid k...\nSET uid [k v...]\nPASSWD uid pass\n"
        }
        Some("DATA") => "Data command:\nUGET uid key\nUSET uid key value\n",
        _ => "Commands:\nPING\nHELP [topic]\nTOKEN->\nUSER->\nDATA->\n",
    }
}

/// Destructures `args` into a fixed-size array, producing a `400` if the
/// argument count does not match.
fn require_args<'a, const N: usize>(args: &'a [String]) -> Result<[&'a str; N], ServiceError> {
    if args.len() != N {
        return Err(ServiceError::bad_request());
    }
    let mut out = [""; N];
    for (slot, arg) in out.iter_mut().zip(args) {
        *slot = arg.as_str();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encrypter::{ClassicEncrypter, MultiPasswordEncrypter, SaltedPasswordEncrypter};
    use crate::token::TokenStore;
    use forge_common::{Database, IdGenerator, InMemoryDatabase, NumericalIdGenerator};
    use std::sync::Arc;

    fn state() -> ServerState {
        let db: Arc<dyn Database> = Arc::new(InMemoryDatabase::new());
        let id_generator: Arc<dyn IdGenerator> = Arc::new(NumericalIdGenerator::new());
        let encrypter = Arc::new(MultiPasswordEncrypter::new(
            Box::new(SaltedPasswordEncrypter::new(id_generator.clone())),
            Box::new(ClassicEncrypter::new("sitekey")),
        ));
        let user_management = UserManagement::new(db.clone(), id_generator.clone(), encrypter, 4096);
        let token_store = TokenStore::new(db, id_generator);
        ServerState { user_management, token_store, max_user_data_key_size: 64, max_user_data_value_size: 4096 }
    }

    fn args(strs: &[&str]) -> Vec<String> {
        strs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn adduser_then_login_roundtrips() {
        let state = state();
        let reply = run_command("ADDUSER", &args(&["joe", "secret"]), &state).unwrap();
        let RespValue::Bulk(Some(user_id)) = reply else { panic!("expected bulk reply") };
        let user_id = String::from_utf8(user_id).unwrap();

        let login = run_command("LOGIN", &args(&["joe", "secret"]), &state).unwrap();
        match login {
            RespValue::Array(items) => {
                assert_eq!(items[0], RespValue::bulk(user_id));
            }
            other => panic!("expected array reply, got {other:?}"),
        }
    }

    #[test]
    fn scenario_password_change_invalidates_old_password() {
        let state = state();
        run_command("ADDUSER", &args(&["joe", "secret"]), &state).unwrap();
        assert!(run_command("LOGIN", &args(&["joe", "secret"]), &state).is_ok());

        let user_id = state.user_management.get_user_id_by_name("joe").unwrap();
        run_command("PASSWD", &args(&[&user_id, "x"]), &state).unwrap();

        assert!(run_command("LOGIN", &args(&["joe", "secret"]), &state).is_err());
        assert!(run_command("LOGIN", &args(&["joe", "x"]), &state).is_ok());
    }

    #[test]
    fn deluser_blocks_future_logins_without_freeing_the_name() {
        let state = state();
        run_command("ADDUSER", &args(&["joe", "secret"]), &state).unwrap();
        let user_id = state.user_management.get_user_id_by_name("joe").unwrap();

        run_command("DELUSER", &args(&[&user_id]), &state).unwrap();
        assert!(run_command("LOGIN", &args(&["joe", "secret"]), &state).is_err());

        // the name stays claimed -- re-registering it must fail, not succeed
        // with a reused id
        let err = run_command("ADDUSER", &args(&["joe", "other"]), &state).unwrap_err();
        assert_eq!(err.code, 409);
    }

    #[test]
    fn unknown_command_is_400() {
        let state = state();
        let err = run_command("BOGUS", &[], &state).unwrap_err();
        assert_eq!(err.code, 400);
    }

    #[test]
    fn checktoken_without_renew_returns_bare_user_id() {
        let state = state();
        let token = state.token_store.get_token("1", TokenType::Api).unwrap();
        let reply = run_command("CHECKTOKEN", &args(&[&token, "TYPE", "api"]), &state).unwrap();
        assert_eq!(reply, RespValue::bulk("1"));
    }

    #[test]
    fn uset_then_uget_roundtrips() {
        let state = state();
        run_command("USET", &args(&["1", "k", "v"]), &state).unwrap();
        let reply = run_command("UGET", &args(&["1", "k"]), &state).unwrap();
        assert_eq!(reply, RespValue::bulk("v"));
    }
}
