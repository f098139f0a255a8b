//! NTLM client (C3, §4.3): SSPI-style negotiate/authenticate/verify built on top of the
//! `sspi` crate, the same package `ironrdp-connector`'s CredSSP sequence uses for its
//! Kerberos/NTLM negotiation (`ironrdp-connector/src/credssp.rs`). Unlike CredSSP, which
//! wraps NTLM inside TSRequest framing, the gateway's RPC auth exchange carries raw NTLM
//! `negotiate`/`challenge`/`authenticate` messages as the `sec_trailer` auth token
//! (§4.2, §4.6 bind sequence), so this module talks to `sspi::Ntlm` directly.

use sspi::builders::EmptyInitializeSecurityContext;
use sspi::{
    AuthIdentity, ClientRequestFlags, CredentialUse, DataRepresentation, EncryptionFlags, Error as SspiError, Ntlm,
    Secret, SecurityBuffer, SecurityBufferType, SecurityStatus, Sspi, SspiImpl, Username,
};

use crate::config::Credentials;
use crate::error::{GatewayError, GatewayResult};

/// Minimum message-integrity signature produced by NTLM's `MAC` (`NTLMSSP_MESSAGE_SIGNATURE`):
/// version(4) + seq_num(4) + checksum(8) = 16 bytes. Used to size the auth-token region
/// reserved in outbound RPC requests before the real signature is computed (§4.6).
pub const NTLM_SIGNATURE_SIZE: u32 = 16;

/// Wraps `sspi::Ntlm` with the narrow surface the RPC channel pair and RPC client need:
/// a two-leg `init_security_context` (negotiate → authenticate), message signing for
/// `PKT_INTEGRITY` (sign, never `PKT_PRIVACY` seal — §4.3, SPEC_FULL §4 supplemental note),
/// and signature verification on inbound PDUs.
pub struct NtlmClient {
    ntlm: Ntlm,
    identity: AuthIdentity,
    done: bool,
}

impl NtlmClient {
    /// Builds a fresh NTLM client bound to one RPC channel (§3 Data model: "NTLM context is
    /// owned by the channel that opened it; no cross-channel sharing").
    #[must_use]
    pub fn new(credentials: &Credentials) -> Self {
        let username = Username::parse(&credentials.username, credentials.domain.as_deref())
            .unwrap_or_else(|_| Username::new(&credentials.username, credentials.domain.as_deref()));
        let identity = AuthIdentity {
            username,
            password: Secret::new(credentials.password.clone()),
        };
        Self {
            ntlm: Ntlm::new(),
            identity,
            done: false,
        }
    }

    /// Runs one leg of negotiate/authenticate. `input` is `None` for the first call
    /// (produces `NEGOTIATE_MESSAGE`); `Some(challenge_bytes)` on the second call (consumes
    /// `CHALLENGE_MESSAGE`, produces `AUTHENTICATE_MESSAGE`). Returns the token to send and
    /// whether the exchange is complete.
    pub fn init_security_context(&mut self, target: &str, input: Option<&[u8]>) -> GatewayResult<(Vec<u8>, bool)> {
        let mut output_token = SecurityBuffer::new(Vec::new(), SecurityBufferType::Token);
        let mut output_buffers = vec![output_token.clone()];

        let mut input_buffers = Vec::new();
        if let Some(bytes) = input {
            input_buffers.push(SecurityBuffer::new(bytes.to_vec(), SecurityBufferType::Token));
        }

        let acquire = self
            .ntlm
            .acquire_credentials_handle()
            .with_credential_use(CredentialUse::Outbound)
            .with_auth_data(&self.identity)
            .execute(&mut self.ntlm)
            .map_err(|e| ntlm_err("acquire_credentials_handle", e))?;
        let mut cred_handle = acquire.credentials_handle;

        let mut builder: EmptyInitializeSecurityContext<'_, _> = self
            .ntlm
            .initialize_security_context()
            .with_credentials_handle(&mut cred_handle)
            .with_context_requirements(ClientRequestFlags::empty())
            .with_target_data_representation(DataRepresentation::Native)
            .with_target_name(target)
            .with_input(&mut input_buffers)
            .with_output(&mut output_buffers);

        let result = self
            .ntlm
            .initialize_security_context_impl(&mut builder)
            .map_err(|e| ntlm_err("initialize_security_context", e))?
            .resolve_to_result()
            .map_err(|e| ntlm_err("initialize_security_context", e))?;

        output_token = output_buffers
            .into_iter()
            .find(|b| b.buffer_type == SecurityBufferType::Token)
            .unwrap_or(output_token);

        self.done = matches!(result.status, SecurityStatus::Ok);
        Ok((output_token.buffer, self.done))
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// `query_context_max_signature_size` (§4.3): the fixed 16-byte NTLM MAC size, used to
    /// reserve `auth_length` in outbound PDUs (§4.6 `write_call`).
    #[must_use]
    pub fn query_context_max_signature_size(&self) -> u32 {
        NTLM_SIGNATURE_SIZE
    }

    /// Signs `plaintext` in place (`PKT_INTEGRITY`: sealing is never requested, per the
    /// supplemental note in SPEC_FULL §4) and returns the detached signature. `seq_num` is
    /// the monotonic per-direction sequence number required by [MS-NLMP] message signing.
    pub fn encrypt(&mut self, plaintext: &[u8], seq_num: u32) -> GatewayResult<Vec<u8>> {
        let mut data_buf = SecurityBuffer::new(plaintext.to_vec(), SecurityBufferType::Data);
        let mut token_buf = SecurityBuffer::new(vec![0u8; NTLM_SIGNATURE_SIZE as usize], SecurityBufferType::Token);
        let mut buffers = vec![data_buf.clone(), token_buf.clone()];

        self.ntlm
            .encrypt_message(EncryptionFlags::empty(), &mut buffers, seq_num)
            .map_err(|e| ntlm_err("encrypt_message", e))?;

        data_buf = buffers.remove(0);
        token_buf = buffers.remove(0);
        debug_assert_eq!(data_buf.buffer, plaintext, "PKT_INTEGRITY must not alter plaintext");
        Ok(token_buf.buffer)
    }

    /// Verifies `signature` over `plaintext` for `seq_num`; returns `SignatureMismatch` on
    /// failure without modifying `plaintext` (§4.3 failure kinds).
    pub fn decrypt(&mut self, plaintext: &[u8], signature: &[u8], seq_num: u32) -> GatewayResult<()> {
        let data_buf = SecurityBuffer::new(plaintext.to_vec(), SecurityBufferType::Data);
        let token_buf = SecurityBuffer::new(signature.to_vec(), SecurityBufferType::Token);
        let mut buffers = vec![data_buf, token_buf];

        self.ntlm
            .decrypt_message(&mut buffers, seq_num)
            .map_err(|_| GatewayError::auth_failed("ntlm::decrypt", "message signature verification failed"))?;
        Ok(())
    }
}

fn ntlm_err(context: &'static str, err: SspiError) -> GatewayError {
    GatewayError::auth_failed(context, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_size_matches_ntlm_mac_layout() {
        let creds = Credentials {
            username: "alice".into(),
            password: "hunter2".into(),
            domain: Some("CONTOSO".into()),
        };
        let client = NtlmClient::new(&creds);
        assert_eq!(client.query_context_max_signature_size(), 16);
        assert!(!client.is_done());
    }
}
