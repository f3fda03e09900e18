//! PubMed adapter over the E-utilities WebEnv history model.
//!
//! `esearch` stores the result set server-side; `efetch` pages walk it with
//! `retstart`/`retmax`. Pages arrive as XML and go through a recoverable
//! parser: a malformed tail degrades to the articles parsed so far instead of
//! failing the page.

use std::sync::Arc;
use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::frame::{Record, Scalar};
use crate::ident;
use crate::net::{ApiClient, ApiError, CounterSnapshot};
use crate::paginate::{PageParser, WebEnvPaginator};
use crate::pipeline::Shutdown;

const SOURCE: &str = "pubmed";

pub struct PubMedClient {
    api: Arc<ApiClient>,
    batch_size: usize,
    wall_clock_cap: Duration,
    email: Option<String>,
    api_key: Option<String>,
}

impl PubMedClient {
    pub fn new(
        api: Arc<ApiClient>,
        batch_size: usize,
        wall_clock_cap: Duration,
        email: Option<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            api,
            batch_size: batch_size.max(1),
            wall_clock_cap,
            email,
            api_key,
        }
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.api.counters()
    }

    fn credential_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(email) = &self.email {
            params.push(("email".to_string(), email.clone()));
        }
        if let Some(key) = &self.api_key {
            params.push(("api_key".to_string(), key.clone()));
        }
        params
    }

    /// Fetch article records for the given PMIDs. A total walk failure that
    /// matches a fallback strategy degrades to one marker row per PMID.
    pub async fn fetch_by_pmids(
        &self,
        pmids: &[String],
        shutdown: &Shutdown,
        fallback_timestamp: &str,
    ) -> Result<Vec<Record>, ApiError> {
        if pmids.is_empty() {
            return Ok(Vec::new());
        }

        let term = pmids
            .iter()
            .map(|pmid| format!("{pmid}[uid]"))
            .collect::<Vec<_>>()
            .join(" OR ");
        let mut search_params = vec![
            ("db".to_string(), "pubmed".to_string()),
            ("term".to_string(), term),
        ];
        search_params.extend(self.credential_params());
        let mut fetch_params = vec![
            ("db".to_string(), "pubmed".to_string()),
            ("retmode".to_string(), "xml".to_string()),
        ];
        fetch_params.extend(self.credential_params());

        let parser: PageParser = Arc::new(|body: &str| Ok(parse_efetch_page(body)));
        let mut paginator = WebEnvPaginator::new(
            self.api.clone(),
            "/esearch.fcgi",
            "/efetch.fcgi",
            search_params,
            fetch_params,
            self.batch_size,
            self.wall_clock_cap,
            parser,
        );

        let mut articles: Vec<Value> = Vec::new();
        let walk = async {
            loop {
                if shutdown.is_cancelled() {
                    break;
                }
                match paginator.next_page().await? {
                    Some(page) => articles.extend(page),
                    None => break,
                }
            }
            Ok::<(), ApiError>(())
        }
        .await;

        if let Err(error) = walk {
            match self.api.fallback_info(&error) {
                Some(info) => {
                    return Ok(pmids
                        .iter()
                        .map(|pmid| {
                            let id = pmid
                                .parse::<i64>()
                                .map_or_else(|_| Scalar::String(pmid.clone()), Scalar::Int);
                            info.clone().into_record("pmid", id, fallback_timestamp)
                        })
                        .collect());
                }
                None => return Err(error),
            }
        }

        Ok(articles.iter().map(normalize_article).collect())
    }
}

/// Parse one efetch XML page into article objects. Parser errors are
/// recoverable: the articles completed before the error are kept.
pub fn parse_efetch_page(xml: &str) -> Vec<Value> {
    let mut reader = Reader::from_str(xml);

    let mut articles: Vec<Value> = Vec::new();
    let mut article: Option<Map<String, Value>> = None;
    let mut path: Vec<String> = Vec::new();
    let mut authors: Vec<(Option<String>, Option<String>, Option<String>)> = Vec::new();
    let mut mesh_terms: Vec<String> = Vec::new();
    let mut chemicals: Vec<String> = Vec::new();
    let mut article_id_type: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).to_string();
                if name == "PubmedArticle" {
                    article = Some(Map::new());
                    authors.clear();
                    mesh_terms.clear();
                    chemicals.clear();
                }
                if name == "Author" {
                    authors.push((None, None, None));
                }
                if name == "ArticleId" {
                    article_id_type = start
                        .attributes()
                        .flatten()
                        .find(|a| a.key.as_ref() == b"IdType")
                        .map(|a| String::from_utf8_lossy(&a.value).to_string());
                }
                path.push(name);
            }
            Ok(Event::End(end)) => {
                let name = String::from_utf8_lossy(end.name().as_ref()).to_string();
                if name == "PubmedArticle" {
                    if let Some(mut map) = article.take() {
                        let formatted: Vec<String> =
                            authors.iter().map(format_author).collect();
                        if !formatted.is_empty() {
                            map.insert("authors".to_string(), json!(formatted));
                        }
                        if !mesh_terms.is_empty() {
                            map.insert("mesh_terms".to_string(), json!(mesh_terms.clone()));
                        }
                        if !chemicals.is_empty() {
                            map.insert("chemicals".to_string(), json!(chemicals.clone()));
                        }
                        articles.push(Value::Object(map));
                    }
                }
                path.pop();
            }
            Ok(Event::Text(text)) => {
                let Some(map) = article.as_mut() else {
                    continue;
                };
                let Ok(text) = text.unescape() else {
                    continue;
                };
                let text = text.trim().to_string();
                if text.is_empty() {
                    continue;
                }
                match path.last().map(String::as_str) {
                    Some("PMID") if path.iter().any(|p| p == "MedlineCitation") => {
                        map.entry("pmid".to_string())
                            .or_insert_with(|| json!(text.clone()));
                    }
                    Some("ArticleTitle") => {
                        map.insert("title".to_string(), json!(text));
                    }
                    Some("AbstractText") => {
                        let merged = match map.get("abstract").and_then(Value::as_str) {
                            Some(existing) => format!("{existing} {text}"),
                            None => text,
                        };
                        map.insert("abstract".to_string(), json!(merged));
                    }
                    Some("Title") if path.iter().any(|p| p == "Journal") => {
                        map.insert("journal".to_string(), json!(text));
                    }
                    Some("Volume") => {
                        map.insert("volume".to_string(), json!(text));
                    }
                    Some("Issue") => {
                        map.insert("issue".to_string(), json!(text));
                    }
                    Some("Year") if path.iter().any(|p| p == "PubDate") => {
                        map.insert("year".to_string(), json!(text));
                    }
                    Some("Month") if path.iter().any(|p| p == "PubDate") => {
                        map.insert("month".to_string(), json!(text));
                    }
                    Some("LastName") => {
                        if let Some(author) = authors.last_mut() {
                            author.0 = Some(text);
                        }
                    }
                    Some("ForeName") => {
                        if let Some(author) = authors.last_mut() {
                            author.1 = Some(text);
                        }
                    }
                    Some("CollectiveName") => {
                        if let Some(author) = authors.last_mut() {
                            author.2 = Some(text);
                        }
                    }
                    Some("DescriptorName") => mesh_terms.push(text),
                    Some("NameOfSubstance") => chemicals.push(text),
                    Some("ArticleId") => {
                        if article_id_type.as_deref() == Some("doi") {
                            map.insert("doi".to_string(), json!(text));
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(error) => {
                warn!(
                    error = %error,
                    recovered_articles = articles.len(),
                    "pubmed_xml_parse_degraded"
                );
                break;
            }
        }
    }
    articles
}

/// PubDate months arrive as numbers or English abbreviations.
fn month_number(raw: &str) -> Option<u32> {
    if let Ok(month) = raw.trim().parse::<u32>() {
        return (1..=12).contains(&month).then_some(month);
    }
    let month = match raw.trim().to_lowercase().as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

fn format_author(author: &(Option<String>, Option<String>, Option<String>)) -> String {
    match author {
        (_, _, Some(collective)) => collective.clone(),
        (Some(last), Some(fore), _) => format!("{fore} {last}"),
        (Some(last), None, _) => last.clone(),
        (None, Some(fore), _) => fore.clone(),
        (None, None, None) => String::new(),
    }
}

/// Map a parsed article into a prefixed record. `pmid` and `doi_clean` stay
/// unprefixed as shared contract fields.
fn normalize_article(article: &Value) -> Record {
    let mut record = Record::new();
    if let Some(pmid) = article
        .get("pmid")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<i64>().ok())
    {
        record.set("pmid", Scalar::Int(pmid));
    }
    if let Some(doi) = article.get("doi").and_then(Value::as_str) {
        record.set(format!("{SOURCE}_doi"), Scalar::String(doi.to_string()));
        if let Some(clean) = ident::normalize_doi(doi) {
            record.set("doi_clean", Scalar::String(clean));
        }
    }
    if let Some(title) = article.get("title").and_then(Value::as_str) {
        record.set(
            format!("{SOURCE}_article_title"),
            Scalar::String(title.to_string()),
        );
    }
    for field in ["abstract", "journal", "volume", "issue", "month"] {
        if let Some(value) = article.get(field).and_then(Value::as_str) {
            record.set(
                format!("{SOURCE}_{field}"),
                Scalar::String(value.to_string()),
            );
        }
    }
    let year = article
        .get("year")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<i64>().ok());
    if let Some(year) = year {
        record.set(format!("{SOURCE}_year"), Scalar::Int(year));
        let month = article
            .get("month")
            .and_then(Value::as_str)
            .and_then(month_number);
        let pub_date = match month {
            Some(month) => format!("{year:04}-{month:02}"),
            None => format!("{year:04}"),
        };
        record.set(format!("{SOURCE}_pub_date"), Scalar::String(pub_date));
    }
    for field in ["authors", "mesh_terms", "chemicals"] {
        if let Some(value) = article.get(field) {
            record.set(
                format!("{SOURCE}_{field}"),
                Scalar::Encoded(crate::frame::encode::canonical_json(value)),
            );
        }
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpProfile;
    use crate::net::testing::{json_ok, MockTransport};

    const ARTICLE_XML: &str = r#"
<PubmedArticleSet>
  <PubmedArticle>
    <MedlineCitation>
      <PMID>2231594</PMID>
      <Article>
        <Journal>
          <Title>Journal of Medicinal Chemistry</Title>
          <JournalIssue><Volume>33</Volume><Issue>10</Issue>
            <PubDate><Year>1990</Year><Month>Oct</Month></PubDate>
          </JournalIssue>
        </Journal>
        <ArticleTitle>Synthesis and evaluation</ArticleTitle>
        <Abstract><AbstractText>Part one.</AbstractText><AbstractText>Part two.</AbstractText></Abstract>
        <AuthorList>
          <Author><LastName>Smith</LastName><ForeName>Jane</ForeName></Author>
          <Author><CollectiveName>The Consortium</CollectiveName></Author>
        </AuthorList>
      </Article>
      <MeshHeadingList>
        <MeshHeading><DescriptorName>Aspirin</DescriptorName></MeshHeading>
        <MeshHeading><DescriptorName>Humans</DescriptorName></MeshHeading>
      </MeshHeadingList>
      <ChemicalList>
        <Chemical><NameOfSubstance>Aspirin</NameOfSubstance></Chemical>
      </ChemicalList>
    </MedlineCitation>
    <PubmedData>
      <ArticleIdList>
        <ArticleId IdType="pubmed">2231594</ArticleId>
        <ArticleId IdType="doi">10.1021/JM00178A015</ArticleId>
      </ArticleIdList>
    </PubmedData>
  </PubmedArticle>
</PubmedArticleSet>"#;

    #[test]
    fn test_parse_article_fields() {
        let articles = parse_efetch_page(ARTICLE_XML);
        assert_eq!(articles.len(), 1);
        let article = &articles[0];
        assert_eq!(article["pmid"], "2231594");
        assert_eq!(article["title"], "Synthesis and evaluation");
        assert_eq!(article["abstract"], "Part one. Part two.");
        assert_eq!(article["journal"], "Journal of Medicinal Chemistry");
        assert_eq!(article["year"], "1990");
        assert_eq!(article["authors"][0], "Jane Smith");
        assert_eq!(article["authors"][1], "The Consortium");
        assert_eq!(article["mesh_terms"][1], "Humans");
        assert_eq!(article["doi"], "10.1021/JM00178A015");
    }

    #[test]
    fn test_malformed_tail_degrades_gracefully() {
        let truncated = format!(
            "{}{}",
            ARTICLE_XML, "<PubmedArticle><MedlineCitation><PMID>1</PMID></Broken"
        );
        let articles = parse_efetch_page(&truncated);
        assert_eq!(articles.len(), 1);
    }

    #[test]
    fn test_normalize_prefixes_and_shared_fields() {
        let articles = parse_efetch_page(ARTICLE_XML);
        let record = normalize_article(&articles[0]);
        assert_eq!(record.get("pmid"), Some(&Scalar::Int(2231594)));
        assert_eq!(
            record.get("doi_clean"),
            Some(&Scalar::String("10.1021/jm00178a015".into()))
        );
        assert!(record.contains("pubmed_article_title"));
        assert!(record.contains("pubmed_mesh_terms"));
        assert!(!record.contains("title"));
        assert_eq!(
            record.get("pubmed_pub_date"),
            Some(&Scalar::String("1990-10".into()))
        );
    }

    #[test]
    fn test_month_number_forms() {
        assert_eq!(month_number("Oct"), Some(10));
        assert_eq!(month_number("10"), Some(10));
        assert_eq!(month_number("13"), None);
        assert_eq!(month_number("Undated"), None);
    }

    #[tokio::test]
    async fn test_fetch_walks_webenv_pages() {
        let escaped = ARTICLE_XML.replace('"', "\\\"").replace('\n', "");
        let transport = Arc::new(MockTransport::new(vec![
            json_ok(
                r#"{"esearchresult": {"webenv": "WE", "querykey": "1", "count": "1", "idlist": ["2231594"]}}"#,
            ),
            json_ok(&format!("\"{escaped}\"")),
        ]));
        let mut profile = HttpProfile::default();
        profile.max_calls = 1000;
        let api = Arc::new(ApiClient::new("pubmed", "http://eutils", &profile, transport));
        let client = PubMedClient::new(api, 100, Duration::from_secs(30), None, None);
        let records = client
            .fetch_by_pmids(
                &["2231594".to_string()],
                &Shutdown::new(),
                "2024-01-01T00:00:00Z",
            )
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("pmid"), Some(&Scalar::Int(2231594)));
    }
}
