/*
 *
 * Copyright 2026 roam authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use async_trait::async_trait;

use super::{AuthInfo, BoxIo, SecurityLevel, TransportCredentials};

/// Credentials that perform no handshake at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct InsecureCredentials;

fn auth_info() -> AuthInfo {
    AuthInfo {
        protocol: "insecure",
        security_level: SecurityLevel::NoSecurity,
        server_name: None,
    }
}

#[async_trait]
impl TransportCredentials for InsecureCredentials {
    async fn client_handshake(
        &self,
        _authority: &str,
        io: BoxIo,
    ) -> Result<(BoxIo, AuthInfo), crate::Error> {
        Ok((io, auth_info()))
    }

    async fn server_handshake(&self, io: BoxIo) -> Result<(BoxIo, AuthInfo), crate::Error> {
        Ok((io, auth_info()))
    }

    fn protocol(&self) -> &'static str {
        "insecure"
    }
}
