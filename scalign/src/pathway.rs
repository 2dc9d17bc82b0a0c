//! Client for the Reactome pathway over-representation service.

use anyhow::Error;
use log::{info, warn};
use scalign_types::PipelineError;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use std::io::Write;
use std::process::{Command, Stdio};

pub const REACTOME_ANALYSIS_URL: &str = "https://reactome.org/AnalysisService/identifiers/projection/";
const REACTOME_BROWSER_URL: &str = "https://reactome.org/PathwayBrowser/#/DTAB=AN&ANALYSIS=";

/// Sends a plain-text body to a URL and returns the response body.
pub trait PathwayTransport {
    fn post(&self, url: &str, body: &str) -> Result<String, Error>;
}

/// Posts with the `curl` executable.
#[derive(Clone, Debug)]
pub struct CurlTransport {
    pub timeout_secs: u64,
}

impl PathwayTransport for CurlTransport {
    fn post(&self, url: &str, body: &str) -> Result<String, Error> {
        let remote = |msg: String| PipelineError::RemoteService(msg);
        let mut child = Command::new("curl")
            .args(["--silent", "--show-error", "--fail", "--max-time"])
            .arg(self.timeout_secs.to_string())
            .args(["-H", "Content-Type: text/plain", "--data-binary", "@-"])
            .arg(url)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| remote(format!("cannot run curl: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(body.as_bytes())
                .map_err(|e| remote(format!("writing request body: {e}")))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| remote(format!("waiting for curl: {e}")))?;
        if !output.status.success() {
            return Err(remote(format!(
                "curl exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
            .into());
        }
        String::from_utf8(output.stdout).map_err(|e| remote(format!("response is not UTF-8: {e}")).into())
    }
}

#[derive(Clone, Debug, PartialEq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct PathwayParams {
    #[default(REACTOME_ANALYSIS_URL.to_string())]
    pub url: String,
    #[default = 20]
    pub page_size: usize,
    #[default = 1]
    pub page: usize,
    #[default = 60]
    pub timeout_secs: u64,
    /// extra attempts after a failed request
    #[default = 2]
    pub retries: usize,
    /// run the enrichment on the first marker table's genes
    #[default = false]
    pub enabled: bool,
    /// marker genes submitted from the top of the table
    #[default = 100]
    pub n_genes: usize,
}

/// One enriched pathway
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathwayRecord {
    pub st_id: String,
    pub name: String,
    pub species: String,
    pub entities_found: u64,
    pub entities_total: u64,
    pub p_value: f64,
    pub fdr: f64,
    pub reactions_found: u64,
    pub reactions_total: u64,
}

/// Parsed analysis result. `token` identifies the stored analysis on the service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathwayReport {
    pub token: String,
    pub pathways_found: u64,
    pub identifiers_not_found: u64,
    pub pathways: Vec<PathwayRecord>,
}

// wire format of the analysis service
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResult {
    summary: RawSummary,
    #[serde(default)]
    pathways_found: u64,
    #[serde(default)]
    identifiers_not_found: u64,
    pathways: Vec<RawPathway>,
}

#[derive(Deserialize)]
struct RawSummary {
    token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPathway {
    st_id: String,
    name: String,
    species: RawSpecies,
    entities: RawEntities,
    reactions: RawReactions,
}

#[derive(Deserialize)]
struct RawSpecies {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEntities {
    found: u64,
    total: u64,
    p_value: f64,
    fdr: f64,
}

#[derive(Deserialize)]
struct RawReactions {
    found: u64,
    total: u64,
}

#[derive(Deserialize)]
struct RawServiceError {
    code: i64,
    #[serde(default)]
    messages: Vec<String>,
}

/// The request body: a `#name` header line followed by one gene per line.
pub fn request_body(name: &str, genes: &[String]) -> String {
    let mut body = format!("#{name}");
    for g in genes {
        body.push('\n');
        body.push_str(g);
    }
    body
}

pub fn request_url(params: &PathwayParams) -> String {
    format!(
        "{}?pageSize={}&page={}&interactors=false",
        params.url, params.page_size, params.page
    )
}

/// Where the analysis identified by `token` can be viewed.
pub fn browse_url(token: &str) -> String {
    format!("{REACTOME_BROWSER_URL}{token}")
}

/// Parse a response body. Service error documents and malformed bodies are remote-service
/// errors.
pub fn parse_report(body: &str) -> Result<PathwayReport, PipelineError> {
    let raw: RawResult = match serde_json::from_str(body) {
        Ok(r) => r,
        Err(e) => {
            return Err(match serde_json::from_str::<RawServiceError>(body) {
                Ok(err) => PipelineError::RemoteService(format!(
                    "service returned {}: {}",
                    err.code,
                    err.messages.join("; ")
                )),
                Err(_) => PipelineError::RemoteService(format!("unexpected response: {e}")),
            })
        }
    };
    Ok(PathwayReport {
        token: raw.summary.token,
        pathways_found: raw.pathways_found,
        identifiers_not_found: raw.identifiers_not_found,
        pathways: raw
            .pathways
            .into_iter()
            .map(|p| PathwayRecord {
                st_id: p.st_id,
                name: p.name,
                species: p.species.name,
                entities_found: p.entities.found,
                entities_total: p.entities.total,
                p_value: p.entities.p_value,
                fdr: p.entities.fdr,
                reactions_found: p.reactions.found,
                reactions_total: p.reactions.total,
            })
            .collect(),
    })
}

/// Run `f` up to `retries + 1` times while it fails with a remote-service error.
pub fn with_retries<T>(retries: usize, mut f: impl FnMut() -> Result<T, Error>) -> Result<T, Error> {
    let mut attempt = 0;
    loop {
        match f() {
            Err(e) if attempt < retries && matches!(e.downcast_ref::<PipelineError>(), Some(PipelineError::RemoteService(_))) => {
                attempt += 1;
                warn!("pathway request failed ({e}), retry {attempt} of {retries}");
            }
            result => return result,
        }
    }
}

/// Submit `genes` as a list called `name` and parse the enrichment result.
pub fn analyze_genes(
    name: &str,
    genes: &[String],
    params: &PathwayParams,
    transport: &impl PathwayTransport,
) -> Result<PathwayReport, Error> {
    if genes.is_empty() {
        return Err(PipelineError::invalid("no genes to submit for pathway analysis").into());
    }
    let url = request_url(params);
    let body = request_body(name, genes);
    let report = with_retries(params.retries, || {
        let response = transport.post(&url, &body)?;
        Ok(parse_report(&response)?)
    })?;
    info!(
        "{} pathways enriched for {} genes; browse at {}",
        report.pathways_found,
        genes.len(),
        browse_url(&report.token)
    );
    Ok(report)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::{Cell, RefCell};

    const RESPONSE: &str = r#"{
        "summary": {"token": "MjAyMzA1", "type": "OVERREPRESENTATION"},
        "pathwaysFound": 1,
        "identifiersNotFound": 2,
        "pathways": [{
            "stId": "R-HSA-6798695",
            "dbId": 6798695,
            "name": "Neutrophil degranulation",
            "species": {"name": "Homo sapiens", "taxId": "9606"},
            "entities": {"found": 12, "total": 480, "pValue": 1.5e-8, "fdr": 2.1e-6, "ratio": 0.03},
            "reactions": {"found": 8, "total": 10, "ratio": 0.001}
        }]
    }"#;

    /// Replays canned responses and records what it was sent.
    struct Canned {
        responses: RefCell<Vec<Result<String, PipelineError>>>,
        calls: Cell<usize>,
        last: RefCell<Option<(String, String)>>,
    }

    impl Canned {
        fn new(mut responses: Vec<Result<String, PipelineError>>) -> Canned {
            responses.reverse();
            Canned {
                responses: RefCell::new(responses),
                calls: Cell::new(0),
                last: RefCell::new(None),
            }
        }
    }

    impl PathwayTransport for Canned {
        fn post(&self, url: &str, body: &str) -> Result<String, Error> {
            self.calls.set(self.calls.get() + 1);
            *self.last.borrow_mut() = Some((url.to_string(), body.to_string()));
            match self.responses.borrow_mut().pop() {
                Some(r) => Ok(r?),
                None => Err(PipelineError::RemoteService("no more responses".into()).into()),
            }
        }
    }

    fn genes() -> Vec<String> {
        vec!["CD14".to_string(), "LYZ".to_string()]
    }

    #[test]
    fn test_request_shape() {
        let transport = Canned::new(vec![Ok(RESPONSE.to_string())]);
        let report = analyze_genes("cluster0", &genes(), &PathwayParams::default(), &transport).unwrap();
        let (url, body) = transport.last.borrow().clone().unwrap();
        assert_eq!(body, "#cluster0\nCD14\nLYZ");
        assert_eq!(
            url,
            "https://reactome.org/AnalysisService/identifiers/projection/?pageSize=20&page=1&interactors=false"
        );

        assert_eq!(report.token, "MjAyMzA1");
        assert_eq!(report.identifiers_not_found, 2);
        let p = &report.pathways[0];
        assert_eq!(p.st_id, "R-HSA-6798695");
        assert_eq!(p.species, "Homo sapiens");
        assert_eq!((p.entities_found, p.entities_total), (12, 480));
        assert_eq!(p.fdr, 2.1e-6);
        assert_eq!(
            browse_url(&report.token),
            "https://reactome.org/PathwayBrowser/#/DTAB=AN&ANALYSIS=MjAyMzA1"
        );
    }

    #[test]
    fn test_service_errors() {
        let body = r#"{"code": 404, "reason": "Not Found", "messages": ["No identifiers"]}"#;
        assert_eq!(
            parse_report(body),
            Err(PipelineError::RemoteService("service returned 404: No identifiers".into()))
        );
        assert!(matches!(parse_report("<html>"), Err(PipelineError::RemoteService(_))));
        assert!(matches!(
            parse_report(r#"{"summary": {}}"#),
            Err(PipelineError::RemoteService(_))
        ));
    }

    #[test]
    fn test_retries() {
        let down = || Err(PipelineError::RemoteService("timeout".into()));
        let transport = Canned::new(vec![down(), down(), Ok(RESPONSE.to_string())]);
        let params = PathwayParams::default();
        assert!(analyze_genes("x", &genes(), &params, &transport).is_ok());
        assert_eq!(transport.calls.get(), 3);

        let transport = Canned::new(vec![down(), down(), down()]);
        assert!(analyze_genes("x", &genes(), &params, &transport).is_err());
        assert_eq!(transport.calls.get(), 3);

        let transport = Canned::new(vec![]);
        let err = analyze_genes("x", &[], &params, &transport).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::InvalidParameter(_))
        ));
        assert_eq!(transport.calls.get(), 0);
    }
}
