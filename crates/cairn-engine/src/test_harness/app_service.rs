//! App Service scenario
//!
//! A Flask web app deployed from a blob: resource group, storage account,
//! container and blob holding the package, a service SAS for the blob, an
//! Application Insights component, an App Service plan, the web app itself
//! and a SQL server with one database.
//!
//! The signed blob URL carries the SAS token and the connection string
//! carries the SQL password, so both exports are secret.

use crate::cell::{Input, Output};
use crate::config::Config;
use crate::error::{ConfigError, GraphError};
use crate::graph::GraphBuilder;
use crate::resource::{Resource, ResourceArgs};
use crate::value::Value;

/// SQL administrator login
pub const SQL_ADMIN: &str = "pulumi";

/// Config key holding the SQL administrator password
pub const SQL_PASSWORD_KEY: &str = "sqlPassword";

/// Exports declared by [`declare_app_service`], in order
pub const EXPORTS: &[&str] = &[
    "web_app_url",
    "scm_web_app_url",
    "log_tail_command",
    "web_ssh_url",
    "deploy_command",
    "blob_url",
    "sql_connection_string",
];

/// Scenario declaration errors
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    /// Declaring the graph failed
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// A required configuration value is missing
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Handles to the declared stack
#[derive(Debug, Clone)]
pub struct AppServiceStack {
    /// Resource group
    pub resource_group: Resource,
    /// Storage account holding the package
    pub storage_account: Resource,
    /// Service SAS granting read access to the container
    pub blob_sas: Resource,
    /// The web app
    pub web_app: Resource,
    /// SQL server
    pub sql_server: Resource,
    /// Signed URL of the package blob (secret)
    pub signed_blob_url: Output,
    /// Public URL of the web app
    pub web_app_url: Output,
}

/// `<app>.azurewebsites.net` -> `<app>.scm.azurewebsites.net`
fn scm_host(graph: &mut GraphBuilder, host: Output) -> Output {
    graph.try_map(host, |v| match v {
        Value::Str(host) => Ok(Value::Str(
            host.replace(".azurewebsites.net", ".scm.azurewebsites.net"),
        )),
        other => Err(format!("expected host name, got {}", other.type_name())),
    })
}

/// Declare the whole stack on `graph`.
///
/// Reads `location` (optional, default `westeurope`) and `sqlPassword`
/// (required, seeded as a secret) from `config`.
///
/// # Errors
/// `ScenarioError::Config` if `sqlPassword` is missing, `ScenarioError::Graph`
/// on a duplicate name.
pub fn declare_app_service(
    graph: &mut GraphBuilder,
    config: &Config,
) -> Result<AppServiceStack, ScenarioError> {
    let password = config.require_secret(graph, SQL_PASSWORD_KEY)?;
    let location = config
        .get("location")
        .unwrap_or_else(|| "westeurope".to_string());

    let resource_group = graph.declare(
        "appservicerg",
        ResourceArgs::new("resources:ResourceGroup")
            .input("location", location)
            .output("name"),
    )?;
    let rg = resource_group.output("name")?;

    let storage_account = graph.declare(
        "appservicesa",
        ResourceArgs::new("storage:StorageAccount")
            .input("resourceGroupName", rg)
            .input("kind", "StorageV2")
            .input("sku", "Standard_LRS")
            .output("name"),
    )?;
    let account = storage_account.output("name")?;

    let container = graph.declare(
        "appservice-container",
        ResourceArgs::new("storage:BlobContainer")
            .input("accountName", account)
            .input("resourceGroupName", rg)
            .input("publicAccess", "None")
            .output("name"),
    )?;
    let container_name = container.output("name")?;

    let blob = graph.declare(
        "appservice-app",
        ResourceArgs::new("storage:Blob")
            .input("resourceGroupName", rg)
            .input("accountName", account)
            .input("containerName", container_name)
            .input("type", "Block")
            .input("source", "app.py")
            .output("name"),
    )?;

    let canonical = graph.concat([
        Input::from("/blob/"),
        account.into(),
        "/".into(),
        container_name.into(),
    ]);
    let blob_sas = graph.declare(
        "appservice-sas",
        ResourceArgs::new("storage:ServiceSas")
            .input("accountName", account)
            .input("resourceGroupName", rg)
            .input("protocols", "https")
            .input("sharedAccessStartTime", "2021-01-01")
            .input("sharedAccessExpiryTime", "2030-01-01")
            .input("resource", "c")
            .input("permissions", "r")
            .input("canonicalizedResource", canonical)
            .input("contentType", "application/json")
            .input("cacheControl", "max-age=5")
            .input("contentDisposition", "inline")
            .input("contentEncoding", "deflate")
            .secret_output("serviceSasToken"),
    )?;

    let signed_blob_url = graph.concat([
        Input::from("https://"),
        account.into(),
        ".blob.core.windows.net/".into(),
        container_name.into(),
        "/".into(),
        blob.output("name")?.into(),
        "?".into(),
        blob_sas.output("serviceSasToken")?.into(),
    ]);

    let insights = graph.declare(
        "appservice-ai",
        ResourceArgs::new("insights:Component")
            .input("applicationType", "web")
            .input("kind", "web")
            .input("ingestionMode", "applicationInsights")
            .input("resourceGroupName", rg)
            .output("instrumentationKey"),
    )?;

    let plan = graph.declare(
        "appservice-asp",
        ResourceArgs::new("web:AppServicePlan")
            .input("resourceGroupName", rg)
            .input("kind", "Linux")
            .input("reserved", true)
            .input("skuTier", "Free")
            .input("skuName", "B1")
            .output("id"),
    )?;

    let sql_server = graph.declare(
        "appservice-sql",
        ResourceArgs::new("sql:Server")
            .input("resourceGroupName", rg)
            .input("administratorLogin", SQL_ADMIN)
            .input("administratorLoginPassword", password)
            .input("version", "12.0")
            .output("name")
            .output("fullyQualifiedDomainName"),
    )?;
    let database = graph.declare(
        "appservice-db",
        ResourceArgs::new("sql:Database")
            .input("resourceGroupName", rg)
            .input("serverName", sql_server.output("name")?)
            .input("sku", "S0")
            .output("name"),
    )?;
    let connection_string = graph.format(
        "Server=tcp:{},1433;Initial Catalog={};User ID={};Password={};",
        [
            Input::from(sql_server.output("fullyQualifiedDomainName")?),
            database.output("name")?.into(),
            SQL_ADMIN.into(),
            password.into(),
        ],
    );

    let web_app = graph.declare(
        "appservice-flask",
        ResourceArgs::new("web:WebApp")
            .input("resourceGroupName", rg)
            .input("serverFarmId", plan.output("id")?)
            .input("linuxFxVersion", "PYTHON|3.9")
            .input("appSettings.WEBSITE_RUN_FROM_PACKAGE", signed_blob_url)
            .input(
                "appSettings.APPINSIGHTS_INSTRUMENTATIONKEY",
                insights.output("instrumentationKey")?,
            )
            .input("appSettings.SCM_DO_BUILD_DURING_DEPLOYMENT", "true")
            .input("connectionStrings.SQLAZURECONNSTR_DB", connection_string)
            .output("name")
            .output("defaultHostName"),
    )?;
    let app_name = web_app.output("name")?;
    let host = web_app.output("defaultHostName")?;

    let web_app_url = graph.concat([Input::from("http://"), host.into()]);
    let scm = scm_host(graph, host);
    let scm_web_app_url = graph.concat([Input::from("http://"), scm.into()]);
    let log_tail_command = graph.format(
        "az webapp log tail --name {} --resource-group {}",
        [app_name, rg],
    );
    let web_ssh_url = graph.concat([Input::from("https://"), scm.into(), "/webssh/host".into()]);
    let deploy_command = graph.format(
        "az webapp deploy --resource-group {} --name {} --src-path app.py --type zip",
        [rg, app_name],
    );

    graph.export("web_app_url", web_app_url)?;
    graph.export("scm_web_app_url", scm_web_app_url)?;
    graph.export("log_tail_command", log_tail_command)?;
    graph.export("web_ssh_url", web_ssh_url)?;
    graph.export("deploy_command", deploy_command)?;
    graph.export("blob_url", signed_blob_url)?;
    graph.export("sql_connection_string", connection_string)?;

    graph.map(web_app_url, |url| {
        tracing::info!("Web App URL: {url}");
        url
    });

    Ok(AppServiceStack {
        resource_group,
        storage_account,
        blob_sas,
        web_app,
        sql_server,
        signed_blob_url,
        web_app_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;

    fn config() -> Config {
        Config::new(MemoryConfig::new().with_secret(SQL_PASSWORD_KEY, "hunter2"))
    }

    #[test]
    fn test_declares_every_export() {
        let mut graph = GraphBuilder::new();
        declare_app_service(&mut graph, &config()).unwrap();
        let sealed = graph.seal().unwrap();
        let names: Vec<&str> = sealed.exports().map(|(name, _)| name).collect();
        assert_eq!(names, EXPORTS);
    }

    #[test]
    fn test_secret_exports() {
        let mut graph = GraphBuilder::new();
        let stack = declare_app_service(&mut graph, &config()).unwrap();
        let sealed = graph.seal().unwrap();

        assert!(sealed.is_secret(stack.signed_blob_url.id()));
        assert!(!sealed.is_secret(stack.web_app_url.id()));
        let secret: Vec<&str> = sealed
            .exports()
            .filter(|(_, id)| sealed.is_secret(*id))
            .map(|(name, _)| name)
            .collect();
        assert_eq!(secret, vec!["blob_url", "sql_connection_string"]);
    }

    #[test]
    fn test_missing_password_is_a_config_error() {
        let mut graph = GraphBuilder::new();
        let err = declare_app_service(&mut graph, &Config::new(MemoryConfig::new())).unwrap_err();
        assert!(matches!(err, ScenarioError::Config(ConfigError::Missing(_))));
    }

    #[test]
    fn test_resource_waves() {
        let mut graph = GraphBuilder::new();
        declare_app_service(&mut graph, &config()).unwrap();
        let sealed = graph.seal().unwrap();
        let waves = sealed.resource_waves();
        assert_eq!(waves[0], vec!["appservicerg"]);
        assert_eq!(
            waves[1],
            vec!["appservice-ai", "appservice-asp", "appservice-sql", "appservicesa"]
        );
        assert_eq!(waves.last().unwrap(), &vec!["appservice-flask"]);
    }
}
