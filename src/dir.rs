use std::sync::Arc;

use eyre::WrapErr as _;

use crate::{
    account::Account,
    api,
    key::AcmeKey,
    req::{req_expect_header, req_get, req_handle_error},
    trans::{NoncePool, Transport},
};

/// An open session against one CA directory.
#[derive(Clone, Debug)]
pub(crate) struct Directory {
    url: String,
    nonce_pool: Arc<NoncePool>,
    api_directory: api::Directory,
}

impl Directory {
    /// Fetches the directory document and prepares a nonce pool for it.
    pub async fn fetch(url: &str) -> eyre::Result<Directory> {
        let res = req_get(url)
            .await
            .wrap_err_with(|| format!("fetching ACME directory {url}"))?;
        let res = req_handle_error(res).await?;
        let api_directory = res.json::<api::Directory>().await?;
        let nonce_pool = Arc::new(NoncePool::new(&api_directory.new_nonce));

        Ok(Directory {
            url: url.to_owned(),
            nonce_pool,
            api_directory,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn api_directory(&self) -> &api::Directory {
        &self.api_directory
    }

    /// Looks up the account bound to `acme_key`. `Ok(None)` if the CA does not know the key.
    pub async fn find_account(&self, acme_key: AcmeKey) -> eyre::Result<Option<Account>> {
        let transport = Transport::new(Arc::clone(&self.nonce_pool), acme_key);

        let res = match transport
            .call_jwk(&self.api_directory.new_account, &api::Account::lookup())
            .await
        {
            Ok(res) => res,
            Err(err)
                if err
                    .downcast_ref::<api::Problem>()
                    .is_some_and(api::Problem::is_account_does_not_exist) =>
            {
                return Ok(None)
            }
            Err(err) => return Err(err),
        };

        self.account_from_response(transport, res).await.map(Some)
    }

    /// Registers a new account for `acme_key`.
    pub async fn register_account(
        &self,
        acme_key: AcmeKey,
        contact: &[String],
        terms_of_service_agreed: bool,
    ) -> eyre::Result<Account> {
        let acc = api::Account::registration(contact, terms_of_service_agreed);

        let transport = Transport::new(Arc::clone(&self.nonce_pool), acme_key);
        let res = transport
            .call_jwk(&self.api_directory.new_account, &acc)
            .await?;

        self.account_from_response(transport, res).await
    }

    async fn account_from_response(
        &self,
        mut transport: Transport,
        res: reqwest::Response,
    ) -> eyre::Result<Account> {
        let kid = req_expect_header(&res, "location")?;
        log::debug!("Key ID is: {kid}");
        let api_account = res.json::<api::Account>().await?;

        // fill in the server returned key ID
        transport.set_key_id(kid.clone());

        Ok(Account::new(
            transport,
            kid,
            api_account,
            self.api_directory.clone(),
        ))
    }
}
