fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build()
}

pub mod registers {
    use crate::catalog::{AccessCode, Catalog};
    use crate::{output, profile};

    /// Search and output the setpoints known for the device.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        profile: profile::Args,
        #[clap(flatten)]
        output: output::Args,
        /// Only list setpoints whose name, description or register contain this string.
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not load the device profile")]
        Profile(#[source] profile::Error),
        #[error("could not output the registers")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize, Debug, PartialEq)]
    pub struct RegistryRow {
        pub register: u16,
        pub access_code: AccessCode,
        pub name: String,
        pub description: String,
        pub additional_parameters: String,
    }

    impl RegistryRow {
        pub fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_uppercase();
            self.name.to_uppercase().contains(&pattern)
                || self.description.to_uppercase().contains(&pattern)
                || self.register.to_string().contains(&pattern)
        }

        fn table_row(&self) -> Vec<String> {
            vec![
                self.register.to_string(),
                self.access_code.to_string(),
                self.name.clone(),
                self.description.clone(),
                self.additional_parameters.clone(),
            ]
        }
    }

    /// One row per setpoint, ordered by access code and then by register.
    pub fn rows(catalog: &Catalog) -> Vec<RegistryRow> {
        let mut rows = catalog
            .iter()
            .map(|(name, spec)| RegistryRow {
                register: spec.address,
                access_code: spec.access,
                name: name.to_string(),
                description: spec.description.clone().unwrap_or_default(),
                additional_parameters: format!("{} {}", spec.type_name(), spec.kind)
                    .trim_end()
                    .to_string(),
            })
            .collect::<Vec<_>>();
        rows.sort_by_key(|r| (r.access_code, r.register));
        rows
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let profile = args.profile.load().map_err(Error::Profile)?;
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output
            .table_headers(vec![
                "Register",
                "AccessCode",
                "Name",
                "Description",
                "AdditionalParameters",
            ])
            .map_err(Error::Output)?;
        for row in rows(&profile.catalog) {
            if let Some(pattern) = &args.filter {
                if !row.is_match(pattern) {
                    continue;
                }
            }
            output.result(|| row.table_row(), || &row).map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)?;
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn hpw300_registry() {
            let profile = crate::profile::Profile::hpw300().unwrap();
            let rows = rows(&profile.catalog);
            assert_eq!(rows.len(), 14);
            let order = rows.iter().map(|r| r.name.as_str()).collect::<Vec<_>>();
            assert_eq!(order, [
                "D01", "F27", "F28", "D07", "F03", "F04", "F05", "F06", "F07", "F08", "F09",
                "F14", "F15", "F16"
            ]);
            let f03 = rows.iter().find(|r| r.name == "F03").unwrap();
            assert_eq!(f03.additional_parameters, "FLOAT scale=1 offset=-100");
            let f16 = rows.iter().find(|r| r.name == "F16").unwrap();
            assert_eq!(f16.table_row(), [
                "38",
                "3",
                "F16",
                "ModBus Parity",
                "ENUM 0=None 1=Even 2=Odd"
            ]);
            let f04 = rows.iter().find(|r| r.name == "F04").unwrap();
            assert_eq!(f04.additional_parameters, "BOOL");
        }

        #[test]
        fn input_registers_sort_after_holding() {
            use crate::catalog::{Kind, SetpointSpec};
            let catalog = Catalog::new([
                ("B", SetpointSpec::new(1, AccessCode::Input, Kind::int())),
                ("A", SetpointSpec::new(9, AccessCode::Holding, Kind::int())),
            ])
            .unwrap();
            let rows = rows(&catalog);
            assert_eq!(rows[0].name, "A");
            assert_eq!(rows[1].additional_parameters, "INT");
        }

        #[test]
        fn filter() {
            let profile = crate::profile::Profile::hpw300().unwrap();
            let rows = rows(&profile.catalog);
            let modbus = rows.iter().filter(|r| r.is_match("modbus")).count();
            assert_eq!(modbus, 3);
            assert_eq!(rows.iter().filter(|r| r.is_match("d0")).count(), 2);
        }
    }
}

pub mod read {
    use crate::connection::{self, Connection};
    use crate::output::write_dump;
    use crate::profile;
    use crate::snapshot::{SharedRefreshError, SnapshotStore};
    use std::io::Write as _;

    /// Read every setpoint once and print them.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        profile: profile::Args,
        /// Print the values as a JSON object instead.
        #[arg(long)]
        json: bool,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not load the device profile")]
        Profile(#[source] profile::Error),
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not connect to the device")]
        Connect(#[source] connection::Error),
        #[error("could not read the device")]
        Refresh(#[source] SharedRefreshError),
        #[error("could not serialize the values to JSON")]
        SerializeJson(#[source] serde_json::Error),
        #[error("could not write data to the terminal")]
        WriteStdout(#[source] std::io::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let profile = args.profile.load().map_err(Error::Profile)?;
        let rt = super::runtime().map_err(Error::Runtime)?;
        let snapshot = rt.block_on(async {
            let connection =
                Connection::new(&args.connection, &profile).await.map_err(Error::Connect)?;
            let store = SnapshotStore::new(connection, profile.catalog.clone(), profile.clock);
            store.refresh().await.map_err(Error::Refresh)
        })?;
        let mut stdout = std::io::stdout().lock();
        if args.json {
            serde_json::to_writer_pretty(&mut stdout, &snapshot.values)
                .map_err(Error::SerializeJson)?;
            writeln!(stdout).map_err(Error::WriteStdout)?;
        } else {
            write_dump(&mut stdout, &profile.name, &profile.catalog, &snapshot)
                .map_err(Error::WriteStdout)?;
        }
        stdout.flush().map_err(Error::WriteStdout)
    }
}

pub mod serve {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use crate::connection::{self, Connection};
    use crate::http::{self, Mode, OnError};
    use crate::profile;
    use crate::snapshot::SnapshotStore;

    /// Serve the device's setpoints as JSON over HTTP.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        profile: profile::Args,
        /// Address to listen on.
        #[arg(long, default_value = "127.0.0.1:6001")]
        listen: SocketAddr,
        /// Read the device on this period in the background instead of on every request.
        #[arg(long)]
        poll_interval: Option<humantime::Duration>,
        /// What to answer when reading the device for a request fails.
        #[arg(
            long,
            value_enum,
            default_value_t = OnError::Strict,
            conflicts_with = "poll_interval"
        )]
        on_error: OnError,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not load the device profile")]
        Profile(#[source] profile::Error),
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not connect to the device")]
        Connect(#[source] connection::Error),
        #[error("poll interval must be greater than zero")]
        ZeroPollInterval,
        #[error("could not listen on {1}")]
        Bind(#[source] std::io::Error, SocketAddr),
        #[error("could not serve HTTP")]
        Http(#[source] http::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let profile = args.profile.load().map_err(Error::Profile)?;
        let poll_interval = args.poll_interval.map(std::time::Duration::from);
        if poll_interval.is_some_and(|p| p.is_zero()) {
            return Err(Error::ZeroPollInterval);
        }
        let rt = super::runtime().map_err(Error::Runtime)?;
        rt.block_on(async {
            let connection =
                Connection::new(&args.connection, &profile).await.map_err(Error::Connect)?;
            let store =
                Arc::new(SnapshotStore::new(connection, profile.catalog.clone(), profile.clock));
            let (mode, _poller) = match poll_interval {
                Some(period) => (Mode::Background, Some(store.spawn_poller(period))),
                None => (Mode::OnRequest(args.on_error), None),
            };
            let listener = tokio::net::TcpListener::bind(args.listen)
                .await
                .map_err(|e| Error::Bind(e, args.listen))?;
            http::serve(listener, http::create_router(store, mode)).await.map_err(Error::Http)
        })
    }
}
