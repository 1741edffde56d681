use std::{error::Error, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use ldap3::LdapConnAsync;
use mimic::ldap::{Directory, DirectoryHandler, Entry, Server};
use tokio::net::TcpListener;

pub const BASE: &str = "dc=example,dc=org";
pub const USERS: &str = "ou=users,dc=example,dc=org";

/// A directory with the base, the users unit and `users` person entries
/// named `user0000`, `user0001` and so on.
pub fn directory(users: usize) -> Directory {
	let mut directory = Directory::new();
	let mut base = Entry::new(BASE);
	base.set("objectClass", vec!["top".to_owned(), "domain".to_owned()]);
	base.set("dc", vec!["example".to_owned()]);
	directory.insert(base);

	let mut unit = Entry::new(USERS);
	unit.set("objectClass", vec!["organizationalUnit".to_owned()]);
	unit.set("ou", vec!["users".to_owned()]);
	directory.insert(unit);

	for index in 0..users {
		let cn = format!("user{index:04}");
		let mut user = Entry::new(format!("cn={cn},{USERS}"));
		user.set("objectClass", vec!["inetOrgPerson".to_owned()]);
		user.set("sn", vec![format!("Surname {index}")]);
		user.set("cn", vec![cn]);
		directory.insert(user);
	}
	directory
}

/// Serve `directory` on an ephemeral local port.
pub async fn serve(directory: Directory) -> Result<(SocketAddr, Arc<Server>), Box<dyn Error>> {
	let listener = TcpListener::bind("127.0.0.1:0").await?;
	let addr = listener.local_addr()?;
	let server = Arc::new(Server::new(Arc::new(DirectoryHandler::new(directory))));
	let serving = server.clone();
	tokio::spawn(async move {
		let _ = serving.serve(listener).await;
	});
	Ok((addr, server))
}

pub async fn ldap_connect(addr: SocketAddr) -> Result<ldap3::Ldap, Box<dyn Error>> {
	let (conn, mut ldap) = LdapConnAsync::new(&format!("ldap://{addr}")).await?;
	let _handle = tokio::spawn(async move {
		if let Err(err) = conn.drive().await {
			tracing::warn!("Ldap connection error {err}");
		}
	});
	ldap.simple_bind("", "").await?.success()?;
	Ok(ldap)
}

pub async fn ldap_add_user(
	ldap: &mut ldap3::Ldap,
	cn: &str,
	sn: &str,
) -> Result<(), Box<dyn Error>> {
	ldap.add(
		&format!("cn={},{USERS}", cn),
		vec![("objectClass", ["inetOrgPerson"].into()), ("cn", [cn].into()), ("sn", [sn].into())],
	)
	.await?
	.success()?;
	Ok(())
}

pub async fn ldap_user_replace_attribute(
	ldap: &mut ldap3::Ldap,
	cn: &str,
	attribute: &str,
	value: &str,
) -> Result<(), Box<dyn Error>> {
	ldap.modify(
		&format!("cn={},{USERS}", cn),
		vec![ldap3::Mod::Replace(attribute, [value].into())],
	)
	.await?
	.success()?;
	Ok(())
}

pub async fn ldap_delete_user(ldap: &mut ldap3::Ldap, cn: &str) -> Result<(), Box<dyn Error>> {
	ldap.delete(&format!("cn={},{USERS}", cn)).await?.success()?;
	Ok(())
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	let deadline = tokio::time::Instant::now() + timeout;
	while tokio::time::Instant::now() < deadline {
		if condition().await {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}
	false
}
